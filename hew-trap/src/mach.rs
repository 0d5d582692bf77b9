//! Darwin kernel exception-port interception.
//!
//! The kernel reports `EXC_BAD_ACCESS` and `EXC_BAD_INSTRUCTION` for a
//! registered thread as a `mach_exception_raise` message on our receive
//! port, with the faulting thread suspended. A dedicated listener thread
//! serializes every delivery:
//!
//! 1. receive and validate the request,
//! 2. read the thread's general-purpose and floating-point state,
//! 3. consult the resolver,
//! 4. write the state back and reply `KERN_SUCCESS` to resume the thread,
//!    or reply `KERN_FAILURE` so the kernel continues its search (task
//!    port, then the BSD signal the fault would otherwise have raised).
//!
//! An unwind cannot jump from the listener: the recovery point lives on
//! the faulting thread's stack. Instead the suspended thread is redirected
//! to call [`resume_at`] with the staged point, and performs the jump
//! itself once resumed. The call runs on a small landing stack owned by
//! the thread's registration, since the faulting stack may be the one that
//! overflowed.
//!
//! Failures of the message protocol leave the faulting thread suspended
//! forever, so they are logged and the process aborts.

use std::cell::{Cell, RefCell};
use std::mem::{self, size_of};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crate::bridge::{self, Action, Fault, FaultKind};
use crate::context::darwin::{
    self, ThreadState, FLOAT_STATE_COUNT, FLOAT_STATE_FLAVOR, THREAD_STATE_COUNT,
    THREAD_STATE_FLAVOR, THREAD_STATE_NONE,
};
use crate::context::RegisterContext;
use crate::error::InstallError;
use crate::install::TrapState;
use crate::recovery::{self, RecoveryPoint};
use crate::stack::{self, StackBounds};

// ── FFI bindings (mach) ─────────────────────────────────────────────────

#[allow(non_camel_case_types)]
type mach_port_t = u32;
#[allow(non_camel_case_types)]
type kern_return_t = i32;

const KERN_SUCCESS: kern_return_t = 0;
const KERN_FAILURE: kern_return_t = 5;
const KERN_RESOURCE_SHORTAGE: kern_return_t = 6;

const MACH_PORT_NULL: mach_port_t = 0;
const MACH_PORT_RIGHT_RECEIVE: u32 = 1;
const MACH_MSG_TYPE_MAKE_SEND: u32 = 20;
const MACH_SEND_MSG: i32 = 0x1;
const MACH_RCV_MSG: i32 = 0x2;
const MACH_MSG_TIMEOUT_NONE: u32 = 0;
/// `MACH_MSGH_BITS_REMOTE_MASK`.
const MSGH_BITS_REMOTE_MASK: u32 = 0x1f;

const EXC_BAD_ACCESS: i32 = 1;
const EXC_BAD_INSTRUCTION: i32 = 2;
const EXC_MASK_BAD_ACCESS: u32 = 1 << EXC_BAD_ACCESS;
const EXC_MASK_BAD_INSTRUCTION: u32 = 1 << EXC_BAD_INSTRUCTION;
const EXCEPTION_DEFAULT: u32 = 1;
const MACH_EXCEPTION_CODES: u32 = 0x8000_0000;

/// `mach_exception_raise` request id.
const EXCEPTION_RAISE_ID: i32 = 2405;
/// Reply ids are the request id plus 100.
const REPLY_ID_OFFSET: i32 = 100;

#[repr(C)]
#[derive(Clone, Copy)]
struct MsgHeader {
    bits: u32,
    size: u32,
    remote_port: mach_port_t,
    local_port: mach_port_t,
    voucher_port: mach_port_t,
    id: i32,
}

#[repr(C, packed(4))]
#[derive(Clone, Copy)]
struct PortDescriptor {
    name: mach_port_t,
    _pad: u32,
    _disposition_type: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct NdrRecord([u8; 8]);

/// `__Request__mach_exception_raise_t`.
#[repr(C, packed(4))]
#[derive(Clone, Copy)]
struct ExceptionRequest {
    header: MsgHeader,
    descriptor_count: u32,
    thread: PortDescriptor,
    task: PortDescriptor,
    ndr: NdrRecord,
    exception: i32,
    code_count: u32,
    code: [i64; 2],
}

/// Request plus room for the trailer the kernel appends.
#[repr(C)]
struct ReceiveBuffer {
    request: ExceptionRequest,
    _trailer: [u8; 512],
}

/// `__Reply__mach_exception_raise_t`.
#[repr(C, packed(4))]
struct ExceptionReply {
    header: MsgHeader,
    ndr: NdrRecord,
    ret_code: kern_return_t,
}

extern "C" {
    static mach_task_self_: mach_port_t;
    static NDR_record: NdrRecord;

    fn mach_thread_self() -> mach_port_t;
    fn mach_port_allocate(task: mach_port_t, right: u32, name: *mut mach_port_t)
        -> kern_return_t;
    fn mach_port_insert_right(
        task: mach_port_t,
        name: mach_port_t,
        right: mach_port_t,
        right_type: u32,
    ) -> kern_return_t;
    fn mach_port_deallocate(task: mach_port_t, name: mach_port_t) -> kern_return_t;
    fn thread_set_exception_ports(
        thread: mach_port_t,
        exception_mask: u32,
        new_port: mach_port_t,
        behavior: i32,
        new_flavor: i32,
    ) -> kern_return_t;
    fn thread_get_state(
        thread: mach_port_t,
        flavor: i32,
        state: *mut u32,
        count: *mut u32,
    ) -> kern_return_t;
    fn thread_set_state(
        thread: mach_port_t,
        flavor: i32,
        state: *const u32,
        count: u32,
    ) -> kern_return_t;
    fn mach_msg(
        msg: *mut MsgHeader,
        option: i32,
        send_size: u32,
        rcv_size: u32,
        rcv_name: mach_port_t,
        timeout: u32,
        notify: mach_port_t,
    ) -> kern_return_t;
}

fn task_self() -> mach_port_t {
    // SAFETY: initialized by libSystem before any Rust code runs.
    unsafe { mach_task_self_ }
}

fn check(call: &'static str, kr: kern_return_t) -> Result<(), InstallError> {
    if kr == KERN_SUCCESS {
        Ok(())
    } else {
        Err(InstallError::MachPort { call, kr })
    }
}

/// Log a protocol failure and abort; the faulting thread can never be
/// resumed once the protocol is broken.
fn fatal(call: &str, kr: kern_return_t) -> ! {
    tracing::error!(call, kr, "exception port protocol failure, aborting");
    std::process::abort()
}

// ── Thread registry ─────────────────────────────────────────────────────

/// Maximum number of concurrently registered threads.
const MAX_THREADS: usize = 1024;

/// Size of the stack a redirected thread lands on to reach its recovery
/// point.
const LANDING_STACK_SIZE: usize = 16 * 1024;

/// What the listener needs to know about a registered thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ThreadEntry {
    activation: *const Cell<*mut RecoveryPoint>,
    /// Top of the thread's landing stack, or 0.
    landing: usize,
    stack: Option<StackBounds>,
}

impl ThreadEntry {
    const EMPTY: Self = Self {
        activation: ptr::null(),
        landing: 0,
        stack: None,
    };
}

/// Maps a thread's port name to its activation slot, landing stack and
/// stack bounds, so the listener can serve a suspended thread without
/// locking.
///
/// Entry fields are published before the port and cleared after it, so a
/// matching port always sees a complete entry.
struct ThreadTable {
    ports: [AtomicU32; MAX_THREADS],
    slots: [AtomicPtr<Cell<*mut RecoveryPoint>>; MAX_THREADS],
    landing: [AtomicUsize; MAX_THREADS],
    stack_low: [AtomicUsize; MAX_THREADS],
    stack_guard: [AtomicUsize; MAX_THREADS],
}

impl ThreadTable {
    const fn new() -> Self {
        Self {
            ports: [const { AtomicU32::new(MACH_PORT_NULL) }; MAX_THREADS],
            slots: [const { AtomicPtr::new(ptr::null_mut()) }; MAX_THREADS],
            landing: [const { AtomicUsize::new(0) }; MAX_THREADS],
            stack_low: [const { AtomicUsize::new(0) }; MAX_THREADS],
            stack_guard: [const { AtomicUsize::new(0) }; MAX_THREADS],
        }
    }

    /// Claims a free index for `port`; fills the entry while the port is
    /// still hidden behind a reservation marker.
    fn register(&self, port: mach_port_t, entry: ThreadEntry) -> bool {
        for (i, p) in self.ports.iter().enumerate() {
            if p
                .compare_exchange(MACH_PORT_NULL, RESERVED, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.slots[i].store(entry.activation.cast_mut(), Ordering::Relaxed);
                self.landing[i].store(entry.landing, Ordering::Relaxed);
                let (low, guard) = entry.stack.map_or((0, 0), |b| (b.low, b.guard));
                self.stack_low[i].store(low, Ordering::Relaxed);
                self.stack_guard[i].store(guard, Ordering::Relaxed);
                p.store(port, Ordering::Release);
                return true;
            }
        }
        false
    }

    fn lookup(&self, port: mach_port_t) -> ThreadEntry {
        let Some(i) = self
            .ports
            .iter()
            .position(|p| p.load(Ordering::Acquire) == port)
        else {
            return ThreadEntry::EMPTY;
        };
        let guard = self.stack_guard[i].load(Ordering::Relaxed);
        ThreadEntry {
            activation: self.slots[i].load(Ordering::Relaxed).cast_const(),
            landing: self.landing[i].load(Ordering::Relaxed),
            stack: (guard != 0).then(|| StackBounds {
                low: self.stack_low[i].load(Ordering::Relaxed),
                guard,
            }),
        }
    }

    fn unregister(&self, port: mach_port_t) {
        if let Some(i) = self
            .ports
            .iter()
            .position(|p| p.load(Ordering::Acquire) == port)
        {
            self.ports[i].store(RESERVED, Ordering::Release);
            self.slots[i].store(ptr::null_mut(), Ordering::Relaxed);
            self.landing[i].store(0, Ordering::Relaxed);
            self.stack_low[i].store(0, Ordering::Relaxed);
            self.stack_guard[i].store(0, Ordering::Relaxed);
            self.ports[i].store(MACH_PORT_NULL, Ordering::Release);
        }
    }
}

/// Marks a table index that is being filled or cleared. Never a valid
/// port name.
const RESERVED: mach_port_t = !0;

static THREADS: ThreadTable = ThreadTable::new();

/// Receive port, once installed.
static EXCEPTION_PORT: AtomicU32 = AtomicU32::new(MACH_PORT_NULL);

/// An anonymous read-write mapping a redirected thread runs on.
struct LandingStack {
    base: *mut libc::c_void,
    len: usize,
}

impl LandingStack {
    fn map() -> Result<Self, InstallError> {
        let len = LANDING_STACK_SIZE.max(stack::page_size());
        // SAFETY: fresh anonymous mapping, no existing memory is touched.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(InstallError::MachPort {
                call: "mmap(landing stack)",
                kr: KERN_RESOURCE_SHORTAGE,
            });
        }
        Ok(Self { base, len })
    }

    fn top(&self) -> usize {
        self.base as usize + self.len
    }
}

impl Drop for LandingStack {
    fn drop(&mut self) {
        // SAFETY: the mapping created in `map`; the thread owning it is
        // exiting, so nothing runs on it.
        unsafe { libc::munmap(self.base, self.len) };
    }
}

/// Removes the thread from the registry when it exits.
///
/// Holds the `mach_thread_self` reference so the port name the kernel
/// reports in exception messages stays the one in the registry.
struct Registration {
    thread: mach_port_t,
    _landing: LandingStack,
}

impl Drop for Registration {
    fn drop(&mut self) {
        THREADS.unregister(self.thread);
        // SAFETY: releases the reference taken in register_thread.
        unsafe { mach_port_deallocate(task_self(), self.thread) };
    }
}

thread_local! {
    static REGISTRATION: RefCell<Option<Registration>> = const { RefCell::new(None) };
}

// ── Installation ────────────────────────────────────────────────────────

/// Allocate the exception port and start the listener.
pub(crate) fn install(state: &'static TrapState) -> Result<(), InstallError> {
    let task = task_self();
    let mut port = MACH_PORT_NULL;
    // SAFETY: port is a valid out-pointer.
    check("mach_port_allocate", unsafe {
        mach_port_allocate(task, MACH_PORT_RIGHT_RECEIVE, &raw mut port)
    })?;
    // SAFETY: we own the receive right named `port`.
    check("mach_port_insert_right", unsafe {
        mach_port_insert_right(task, port, port, MACH_MSG_TYPE_MAKE_SEND)
    })?;

    std::thread::Builder::new()
        .name("hew-trap-ports".into())
        .spawn(move || listen(port, state))
        .map_err(|e| InstallError::Listener(e.to_string()))?;

    EXCEPTION_PORT.store(port, Ordering::Release);
    tracing::trace!(port, "exception port listener started");
    Ok(())
}

/// Route the calling thread's bad-access and bad-instruction exceptions to
/// our port and record its activation slot, landing stack and stack bounds.
pub(crate) fn register_thread() -> Result<(), InstallError> {
    let port = EXCEPTION_PORT.load(Ordering::Acquire);
    if port == MACH_PORT_NULL {
        return Ok(());
    }
    if REGISTRATION.with(|r| r.borrow().is_some()) {
        return Ok(());
    }

    let landing = LandingStack::map()?;
    // SAFETY: no preconditions; the returned reference is owned by the
    // registration.
    let thread = unsafe { mach_thread_self() };
    // SAFETY: thread is our own thread port and port holds a send right.
    let kr = unsafe {
        thread_set_exception_ports(
            thread,
            EXC_MASK_BAD_ACCESS | EXC_MASK_BAD_INSTRUCTION,
            port,
            (EXCEPTION_DEFAULT | MACH_EXCEPTION_CODES) as i32,
            THREAD_STATE_NONE,
        )
    };
    let error = if kr != KERN_SUCCESS {
        Some(InstallError::MachPort {
            call: "thread_set_exception_ports",
            kr,
        })
    } else if !THREADS.register(
        thread,
        ThreadEntry {
            activation: recovery::activation_slot(),
            landing: landing.top(),
            stack: stack::recorded(),
        },
    ) {
        Some(InstallError::MachPort {
            call: "thread registry",
            kr: KERN_RESOURCE_SHORTAGE,
        })
    } else {
        None
    };
    if let Some(err) = error {
        // SAFETY: thread names the send right mach_thread_self gave us.
        unsafe { mach_port_deallocate(task_self(), thread) };
        return Err(err);
    }
    REGISTRATION.with(|r| {
        *r.borrow_mut() = Some(Registration {
            thread,
            _landing: landing,
        });
    });
    Ok(())
}

// ── Listener ────────────────────────────────────────────────────────────

fn listen(port: mach_port_t, state: &'static TrapState) -> ! {
    // SAFETY: all-zero is a valid (empty) buffer.
    let mut buf: Box<ReceiveBuffer> = Box::new(unsafe { mem::zeroed() });
    loop {
        // SAFETY: buf is large enough for the request and its trailer.
        let kr = unsafe {
            mach_msg(
                &raw mut buf.request.header,
                MACH_RCV_MSG,
                0,
                size_of::<ReceiveBuffer>() as u32,
                port,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        if kr != KERN_SUCCESS {
            fatal("mach_msg(receive)", kr);
        }

        let request = buf.request;
        let ret_code = handle(&request, state);

        let mut reply = reply_to(&request.header, ret_code);
        // SAFETY: reply is a complete message addressed to the kernel's
        // reply port.
        let kr = unsafe {
            mach_msg(
                &raw mut reply.header,
                MACH_SEND_MSG,
                size_of::<ExceptionReply>() as u32,
                0,
                MACH_PORT_NULL,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        if kr != KERN_SUCCESS {
            fatal("mach_msg(send)", kr);
        }

        // SAFETY: the request carried send rights for both ports.
        unsafe {
            mach_port_deallocate(task_self(), request.thread.name);
            mach_port_deallocate(task_self(), request.task.name);
        }
    }
}

fn reply_to(request: &MsgHeader, ret_code: kern_return_t) -> ExceptionReply {
    ExceptionReply {
        header: MsgHeader {
            bits: request.bits & MSGH_BITS_REMOTE_MASK,
            size: size_of::<ExceptionReply>() as u32,
            remote_port: request.remote_port,
            local_port: MACH_PORT_NULL,
            voucher_port: MACH_PORT_NULL,
            id: request.id + REPLY_ID_OFFSET,
        },
        // SAFETY: NDR_record is an immutable libSystem constant.
        ndr: unsafe { NDR_record },
        ret_code,
    }
}

fn classify(
    request: &ExceptionRequest,
    sp: usize,
    stack: Option<StackBounds>,
) -> Option<(FaultKind, Option<usize>)> {
    let code = request.code;
    match request.exception {
        EXC_BAD_ACCESS => {
            let address = Some(code[1] as usize);
            Some((FaultKind::memory(address, sp, stack), address))
        }
        EXC_BAD_INSTRUCTION => Some((FaultKind::IllegalInstruction, None)),
        _ => None,
    }
}

/// Process one exception request; returns the reply code.
fn handle(request: &ExceptionRequest, state: &'static TrapState) -> kern_return_t {
    let id = request.header.id;
    if id != EXCEPTION_RAISE_ID {
        tracing::error!(id, "unexpected exception message id, aborting");
        std::process::abort();
    }
    let thread = request.thread.name;

    // SAFETY: all-zero is a valid thread state.
    let mut regs: ThreadState = unsafe { mem::zeroed() };
    let mut count = THREAD_STATE_COUNT;
    // SAFETY: regs holds THREAD_STATE_COUNT words.
    let kr = unsafe {
        thread_get_state(
            thread,
            THREAD_STATE_FLAVOR,
            (&raw mut regs).cast(),
            &raw mut count,
        )
    };
    if kr != KERN_SUCCESS {
        fatal("thread_get_state", kr);
    }

    let mut float = [0u32; FLOAT_STATE_COUNT as usize];
    let mut float_count = FLOAT_STATE_COUNT;
    // SAFETY: float holds FLOAT_STATE_COUNT words.
    let kr = unsafe {
        thread_get_state(
            thread,
            FLOAT_STATE_FLAVOR,
            float.as_mut_ptr(),
            &raw mut float_count,
        )
    };
    if kr != KERN_SUCCESS {
        fatal("thread_get_state(float)", kr);
    }

    let entry = THREADS.lookup(thread);
    let Some((kind, address)) = classify(request, regs.sp(), entry.stack) else {
        return KERN_FAILURE;
    };

    let action = {
        // SAFETY: the faulting thread is suspended until we reply, so its
        // activation slot (if registered) is stable and unobserved.
        let mut fault = unsafe { Fault::for_thread(kind, address, &mut regs, entry.activation) };
        bridge::dispatch(state.resolver, &state.stats, &mut fault)
    };

    match action {
        Action::Forward => return KERN_FAILURE,
        Action::Resume => {}
        Action::Unwind(handle, trap) => {
            let point = handle.stage(trap);
            let landing = (entry.landing != 0).then_some(entry.landing);
            darwin::redirect_call(
                &mut regs,
                recovery::resume_at as usize,
                point as usize,
                landing,
            );
        }
    }

    // SAFETY: writing back the states read above, same flavors and counts.
    unsafe {
        let kr = thread_set_state(
            thread,
            FLOAT_STATE_FLAVOR,
            float.as_ptr(),
            float_count,
        );
        if kr != KERN_SUCCESS {
            fatal("thread_set_state(float)", kr);
        }
        let kr = thread_set_state(thread, THREAD_STATE_FLAVOR, (&raw const regs).cast(), count);
        if kr != KERN_SUCCESS {
            fatal("thread_set_state", kr);
        }
    }
    KERN_SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_layouts_match_the_kernel() {
        assert_eq!(size_of::<MsgHeader>(), 24);
        assert_eq!(size_of::<PortDescriptor>(), 12);
        assert_eq!(size_of::<ExceptionRequest>(), 84);
        assert_eq!(size_of::<ExceptionReply>(), 36);
    }

    fn request(exception: i32, addr: i64) -> ExceptionRequest {
        // SAFETY: plain old data.
        let mut req: ExceptionRequest = unsafe { mem::zeroed() };
        req.header.id = EXCEPTION_RAISE_ID;
        req.exception = exception;
        req.code_count = 2;
        req.code = [1, addr];
        req
    }

    #[test]
    fn bad_access_reports_the_address() {
        let req = request(EXC_BAD_ACCESS, 0x1000);
        assert_eq!(
            classify(&req, 0x7fff_0000, None),
            Some((FaultKind::AccessViolation, Some(0x1000)))
        );
    }

    #[test]
    fn bad_access_near_sp_is_overflow() {
        let req = request(EXC_BAD_ACCESS, 0x7fff_0000 - 16);
        assert_eq!(
            classify(&req, 0x7fff_0000, None).map(|(k, _)| k),
            Some(FaultKind::StackOverflow)
        );
    }

    #[test]
    fn bad_access_above_sp_is_not_overflow() {
        let sp = 0x7fff_0000;
        let bounds = StackBounds {
            low: sp - 0x8_0000,
            guard: 0x4000,
        };
        let req = request(EXC_BAD_ACCESS, (sp + 0x25c0) as i64);
        assert_eq!(
            classify(&req, sp, Some(bounds)).map(|(k, _)| k),
            Some(FaultKind::AccessViolation)
        );
        let req = request(EXC_BAD_ACCESS, (bounds.low - 8) as i64);
        assert_eq!(
            classify(&req, sp, Some(bounds)).map(|(k, _)| k),
            Some(FaultKind::StackOverflow)
        );
    }

    #[test]
    fn other_exceptions_are_not_classified() {
        // EXC_ARITHMETIC
        assert_eq!(classify(&request(3, 0), 0, None), None);
        assert_eq!(
            classify(&request(EXC_BAD_INSTRUCTION, 0), 0, None),
            Some((FaultKind::IllegalInstruction, None))
        );
    }

    #[test]
    fn reply_addresses_the_kernel_reply_port() {
        let mut req = request(EXC_BAD_ACCESS, 0);
        req.header.bits = 0x1200 | 0x12;
        req.header.remote_port = 77;
        let reply = reply_to(&req.header, KERN_FAILURE);
        let header = reply.header;
        assert_eq!(header.bits, 0x12);
        assert_eq!(header.remote_port, 77);
        assert_eq!(header.local_port, MACH_PORT_NULL);
        assert_eq!(header.id, 2505);
        let ret_code = reply.ret_code;
        assert_eq!(ret_code, KERN_FAILURE);
    }

    #[test]
    fn thread_table_tracks_registrations() {
        let table = ThreadTable::new();
        let entry = ThreadEntry {
            activation: recovery::activation_slot(),
            landing: 0x6000_4000,
            stack: Some(StackBounds {
                low: 0x7000_0000,
                guard: 0x4000,
            }),
        };
        assert_eq!(table.lookup(0x1234), ThreadEntry::EMPTY);
        assert!(table.register(0x1234, entry));
        assert_eq!(table.lookup(0x1234), entry);
        table.unregister(0x1234);
        assert_eq!(table.lookup(0x1234), ThreadEntry::EMPTY);
    }

    #[test]
    fn unrecorded_bounds_round_trip_as_none() {
        let table = ThreadTable::new();
        let entry = ThreadEntry {
            activation: recovery::activation_slot(),
            landing: 0,
            stack: None,
        };
        assert!(table.register(0x55, entry));
        assert_eq!(table.lookup(0x55).stack, None);
    }

    #[test]
    fn landing_stack_is_writable_to_its_top() {
        let landing = LandingStack::map().unwrap();
        let top = landing.top();
        assert_eq!(top % 16, 0);
        // SAFETY: the last word of the mapping.
        unsafe {
            let word = (top - 8) as *mut u64;
            word.write(0xfeed);
            assert_eq!(word.read(), 0xfeed);
        }
    }
}
