//! fork/exec runner with privilege dropping.
//!
//! Architecture:
//!
//! ```text
//! start()
//!  └─ fork() ──> Child:
//!                  setpgid(0, 0)
//!                  remap files onto 0..N, chdir, setrlimit
//!                  no_new_privs, drop capabilities
//!                  report READY ──────────────┐
//!                  block on go pipe           │   parent returns PendingExec
//!  release() ── write go ──>                  │
//!                  exec(program)              │
//!                  (on failure: report errno) │
//!  release() reads report pipe: EOF = exec succeeded (pipe was close-on-exec)
//! ```
//!
//! Everything the child touches is prepared before fork; the child itself
//! only issues raw syscalls.
#![allow(unsafe_code)]

use std::ffi::{CString, NulError};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, pipe2, ForkResult, Pid};
use tracing::{debug, warn};

use super::{PendingExec, RunSpec, Runner};
use crate::error::RunnerError;
use crate::transport::LimitKind;

const STAGE_READY: u8 = 0;
const STAGE_SETPGID: u8 = 1;
const STAGE_FILES: u8 = 2;
const STAGE_CHDIR: u8 = 3;
const STAGE_RLIMIT: u8 = 4;
const STAGE_NO_NEW_PRIVS: u8 = 5;
const STAGE_CAPS: u8 = 6;
const STAGE_EXEC: u8 = 7;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;
const MAX_CAP: libc::c_ulong = 63;

/// Runner that forks this process and execs the program in the child.
#[derive(Debug, Default, Clone)]
pub struct ForkExecRunner;

impl ForkExecRunner {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Runner for ForkExecRunner {
    fn start(&self, spec: &RunSpec) -> Result<Box<dyn PendingExec>, RunnerError> {
        let plan = ChildPlan::prepare(spec)?;
        let mut scratch = vec![-1; plan.files.len()];

        let (report_read, report_write) = pipe2(OFlag::O_CLOEXEC).map_err(RunnerError::Pipe)?;
        let (go_read, go_write) = pipe2(OFlag::O_CLOEXEC).map_err(RunnerError::Pipe)?;

        // SAFETY: the child only performs async-signal-safe syscalls on data
        // prepared above, then execs or _exits.
        match unsafe { fork() }.map_err(RunnerError::Fork)? {
            ForkResult::Child => {
                child_main(
                    &plan,
                    &mut scratch,
                    report_write.as_raw_fd(),
                    go_read.as_raw_fd(),
                );
            }
            ForkResult::Parent { child } => {
                drop(report_write);
                drop(go_read);
                debug!(pid = child.as_raw(), "forked child");

                let mut report = File::from(report_read);
                match read_report(&mut report) {
                    Ok(Some((STAGE_READY, _))) => {
                        let pending: Box<dyn PendingExec> = Box::new(ForkExecPending {
                            pid: child,
                            report,
                            go: File::from(go_write),
                        });
                        Ok(pending)
                    }
                    Ok(Some((stage, errno))) => {
                        reap(child);
                        Err(RunnerError::Setup {
                            stage: stage_name(stage),
                            errno,
                        })
                    }
                    Ok(None) | Err(_) => {
                        reap(child);
                        Err(RunnerError::ChildVanished)
                    }
                }
            }
        }
    }
}

struct ForkExecPending {
    pid: Pid,
    report: File,
    go: File,
}

impl PendingExec for ForkExecPending {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn release(self: Box<Self>) -> Result<Pid, RunnerError> {
        let Self {
            pid,
            mut report,
            mut go,
        } = *self;

        if go.write_all(&[1]).is_err() {
            reap(pid);
            return Err(RunnerError::ChildVanished);
        }
        drop(go);

        match read_report(&mut report) {
            Ok(None) => Ok(pid),
            Ok(Some((_, errno))) => {
                reap(pid);
                Err(RunnerError::Exec(errno))
            }
            Err(e) => {
                warn!(pid = pid.as_raw(), error = %e, "lost exec report pipe");
                Ok(pid)
            }
        }
    }

    fn abort(self: Box<Self>) {
        let pid = self.pid;
        // Closing the go pipe alone makes the child exit; the kill covers a
        // child that is not scheduled yet.
        drop(self);
        let _ = kill(pid, Signal::SIGKILL);
        reap(pid);
        debug!(pid = pid.as_raw(), "aborted child before exec");
    }
}

fn reap(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            _ => break,
        }
    }
}

/// Read one `[stage, errno]` report. `None` means the writer closed.
fn read_report(report: &mut File) -> io::Result<Option<(u8, Errno)>> {
    let mut stage = [0u8; 1];
    loop {
        match report.read(&mut stage) {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    if stage[0] == STAGE_READY {
        return Ok(Some((STAGE_READY, Errno::UnknownErrno)));
    }
    let mut errno = [0u8; 4];
    report.read_exact(&mut errno)?;
    Ok(Some((stage[0], Errno::from_raw(i32::from_ne_bytes(errno)))))
}

const fn stage_name(stage: u8) -> &'static str {
    match stage {
        STAGE_SETPGID => "setpgid",
        STAGE_FILES => "files",
        STAGE_CHDIR => "chdir",
        STAGE_RLIMIT => "setrlimit",
        STAGE_NO_NEW_PRIVS => "no_new_privs",
        STAGE_CAPS => "capabilities",
        STAGE_EXEC => "exec",
        _ => "unknown",
    }
}

const fn resource(kind: LimitKind) -> Resource {
    match kind {
        LimitKind::Cpu => Resource::RLIMIT_CPU,
        LimitKind::Fsize => Resource::RLIMIT_FSIZE,
        LimitKind::Data => Resource::RLIMIT_DATA,
        LimitKind::Stack => Resource::RLIMIT_STACK,
        LimitKind::Core => Resource::RLIMIT_CORE,
        LimitKind::Nofile => Resource::RLIMIT_NOFILE,
        LimitKind::Nproc => Resource::RLIMIT_NPROC,
        LimitKind::AddressSpace => Resource::RLIMIT_AS,
        LimitKind::Memlock => Resource::RLIMIT_MEMLOCK,
    }
}

/// Pre-fork snapshot of a [`RunSpec`] in exec-ready form.
struct ChildPlan {
    path: CString,
    // Keep the strings alive behind the pointer arrays.
    _argv: Vec<CString>,
    _envv: Vec<CString>,
    argv_ptrs: Vec<*const libc::c_char>,
    envv_ptrs: Vec<*const libc::c_char>,
    exec_fd: Option<RawFd>,
    files: Vec<RawFd>,
    work_dir: CString,
    rlimits: Vec<(Resource, u64, u64)>,
    no_new_privs: bool,
    drop_caps: bool,
}

impl ChildPlan {
    fn prepare(spec: &RunSpec) -> Result<Self, RunnerError> {
        if spec.argv.is_empty() {
            return Err(RunnerError::EmptyArgv);
        }
        let argv = to_cstrings(&spec.argv)?;
        let envv = to_cstrings(&spec.envv)?;
        let argv_ptrs = null_terminated(&argv);
        let envv_ptrs = null_terminated(&envv);

        Ok(Self {
            path: argv[0].clone(),
            argv_ptrs,
            envv_ptrs,
            _argv: argv,
            _envv: envv,
            exec_fd: spec.exec_file.as_ref().map(AsRawFd::as_raw_fd),
            files: spec.files.iter().map(AsRawFd::as_raw_fd).collect(),
            work_dir: CString::new(spec.work_dir.as_os_str().as_bytes())?,
            rlimits: spec
                .rlimits
                .iter()
                .map(|l| (resource(l.resource), l.soft, l.hard))
                .collect(),
            no_new_privs: spec.no_new_privs,
            drop_caps: spec.drop_caps,
        })
    }
}

fn to_cstrings(strings: &[String]) -> Result<Vec<CString>, NulError> {
    strings.iter().map(|s| CString::new(s.as_bytes())).collect()
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Child side. Never returns.
fn child_main(plan: &ChildPlan, scratch: &mut [RawFd], report: RawFd, go: RawFd) -> ! {
    if let Err(e) = nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
        die(report, STAGE_SETPGID, e);
    }

    // Lift everything above the 0..N target range first so no dup2 below
    // clobbers a descriptor still needed.
    let floor = plan.files.len().max(3) as RawFd;
    let report = dup_above(report, floor).unwrap_or_else(|e| die(report, STAGE_FILES, e));
    let go = dup_above(go, floor).unwrap_or_else(|e| die(report, STAGE_FILES, e));
    let exec_fd = plan
        .exec_fd
        .map(|fd| dup_above(fd, floor).unwrap_or_else(|e| die(report, STAGE_FILES, e)));
    for (slot, &fd) in scratch.iter_mut().zip(&plan.files) {
        *slot = dup_above(fd, floor).unwrap_or_else(|e| die(report, STAGE_FILES, e));
    }
    for (target, &high) in scratch.iter().enumerate() {
        if let Err(e) = nix::unistd::dup2(high, target as RawFd) {
            die(report, STAGE_FILES, e);
        }
    }
    // Standard descriptors not supplied by the controller must not reach
    // the program.
    for fd in plan.files.len()..3 {
        // SAFETY: fcntl(F_SETFD) on a possibly closed fd just fails.
        unsafe { libc::fcntl(fd as RawFd, libc::F_SETFD, libc::FD_CLOEXEC) };
    }

    if let Err(e) = nix::unistd::chdir(plan.work_dir.as_c_str()) {
        die(report, STAGE_CHDIR, e);
    }

    for &(resource, soft, hard) in &plan.rlimits {
        if let Err(e) = setrlimit(resource, soft, hard) {
            die(report, STAGE_RLIMIT, e);
        }
    }

    if plan.no_new_privs {
        // SAFETY: prctl(PR_SET_NO_NEW_PRIVS, 1) is idempotent.
        if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
            die(report, STAGE_NO_NEW_PRIVS, Errno::last());
        }
    }

    if plan.drop_caps {
        if let Err(e) = drop_capabilities() {
            die(report, STAGE_CAPS, e);
        }
    }

    // SAFETY: raw read/write on pipe fds owned by the child.
    unsafe {
        let ready = [STAGE_READY];
        libc::write(report, ready.as_ptr().cast(), 1);
        let mut go_byte = [0u8; 1];
        if libc::read(go, go_byte.as_mut_ptr().cast(), 1) != 1 {
            libc::_exit(1);
        }
    }

    // SAFETY: pointer arrays are NUL terminated and outlive the call.
    unsafe {
        match exec_fd {
            Some(fd) => libc::fexecve(fd, plan.argv_ptrs.as_ptr(), plan.envv_ptrs.as_ptr()),
            None => libc::execve(
                plan.path.as_ptr(),
                plan.argv_ptrs.as_ptr(),
                plan.envv_ptrs.as_ptr(),
            ),
        };
    }
    die(report, STAGE_EXEC, Errno::last())
}

/// Report `[stage, errno]` to the parent and exit.
fn die(report: RawFd, stage: u8, errno: Errno) -> ! {
    let mut msg = [0u8; 5];
    msg[0] = stage;
    msg[1..].copy_from_slice(&(errno as i32).to_ne_bytes());
    // SAFETY: plain write(2)/_exit(2) on an fd we own.
    unsafe {
        libc::write(report, msg.as_ptr().cast(), msg.len());
        libc::_exit(127)
    }
}

fn dup_above(fd: RawFd, floor: RawFd) -> Result<RawFd, Errno> {
    // SAFETY: fcntl(F_DUPFD_CLOEXEC) has no memory effects.
    let high = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor) };
    Errno::result(high)
}

/// Clear bounding and ambient sets, then zero effective, permitted and
/// inheritable sets via capset(2).
fn drop_capabilities() -> Result<(), Errno> {
    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: i32,
    }

    #[repr(C)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    for cap in 0..=MAX_CAP {
        // SAFETY: unknown capability numbers fail with EINVAL; missing
        // CAP_SETPCAP fails with EPERM. Both leave the set as it was.
        unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
    }
    // SAFETY: as above; older kernels lack ambient capabilities.
    unsafe {
        libc::prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_CLEAR_ALL,
            0,
            0,
            0,
        )
    };

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    let data = [
        CapUserData {
            effective: 0,
            permitted: 0,
            inheritable: 0,
        },
        CapUserData {
            effective: 0,
            permitted: 0,
            inheritable: 0,
        },
    ];
    // SAFETY: version 3 header for the calling thread with two data entries.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_capset,
            std::ptr::addr_of!(header),
            data.as_ptr(),
        )
    };
    Errno::result(rc).map(drop)
}
