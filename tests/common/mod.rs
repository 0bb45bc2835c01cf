//! Shared fixtures: a mock host, ELF images and a small ARM interpreter.

#![allow(dead_code)]

pub mod cpu;
pub mod host;
pub mod image;

use uhook::hook::FunctionHook;
use uhook::registry::Registry;
use uhook::regs::CPSR_T;
use uhook::{Dispatcher, Pid, ProcessOps, Regs, SessionConfig, TrapOutcome};

use cpu::{Cpu, Step};
use host::MockHost;
use image::{ElfImage, link_map};

pub const EXE_BASE: u32 = 0x8000;
pub const LIBC_BASE: u32 = 0x4000_0000;
pub const LD_BASE: u32 = 0x4010_0000;
pub const R_DEBUG: u32 = 0x0002_0000;
pub const STACK_TOP: u32 = 0x0010_0000;

/// `foo`: push {r4, lr}; add r0, r0, #1; pop {r4, pc}
pub const FOO: u32 = 0x8400;
/// `thumb_add`: the same body in Thumb, at an odd (tagged) address.
pub const THUMB_ADD: u32 = 0x8501;
/// `main`: mov r0, #41; bl foo; mov r1, r0; (stop)
pub const MAIN: u32 = 0x8600;
pub const MAIN_CALL_FOO: u32 = 0x8604;
pub const MAIN_DONE: u32 = 0x860c;
/// `call_thumb`: mov r0, #41; blx thumb_add; mov r1, r0; (stop)
pub const CALL_THUMB: u32 = 0x8610;
pub const CALL_THUMB_DONE: u32 = 0x861c;

/// libc exports, each `mov r0, #0; bx lr`.
pub const LIBC_FUNCS: &[&str] = &[
    "pthread_create",
    "pthread_exit",
    "pthread_join",
    "pthread_mutex_lock",
    "pthread_mutex_trylock",
    "pthread_mutex_unlock",
    "pthread_cond_wait",
    "pthread_cond_signal",
    "sem_wait",
    "sem_post",
    "waitpid",
    "wait",
    "dlopen",
    "pthread_mutex_timedlock",
    "pthread_mutex_init",
    "pthread_mutex_destroy",
    "pthread_rwlock_init",
    "pthread_rwlock_destroy",
    "pthread_rwlock_rdlock",
    "pthread_rwlock_wrlock",
    "pthread_rwlock_tryrdlock",
    "pthread_rwlock_trywrlock",
    "pthread_rwlock_timedrdlock",
    "pthread_rwlock_timedwrlock",
    "pthread_rwlock_unlock",
    "pthread_spin_init",
    "pthread_spin_destroy",
    "pthread_spin_lock",
    "pthread_spin_trylock",
    "pthread_spin_unlock",
    "pthread_cond_init",
    "pthread_cond_destroy",
    "pthread_cond_timedwait",
    "pthread_cond_broadcast",
    "sem_init",
    "sem_destroy",
    "sem_open",
    "sem_close",
    "sem_trywait",
    "sem_timedwait",
    "mq_open",
    "mq_close",
    "mq_receive",
    "mq_timedreceive",
    "mq_send",
    "mq_timedsend",
    "semget",
    "semop",
    "semtimedop",
    "semctl",
    "msgget",
    "msgsnd",
    "msgrcv",
    "msgctl",
];

pub fn libc_addr(name: &str) -> u32 {
    let i = LIBC_FUNCS.iter().position(|n| *n == name).unwrap();
    LIBC_BASE + 0x400 + 0x10 * i as u32
}

pub const LD_DEBUG_STATE: u32 = LD_BASE + 0x400;

/// Process `pid` with an executable, libc and the dynamic linker loaded.
pub fn standard_process(host: &MockHost, pid: Pid) {
    host.spawn(pid, None, Some(EXE_BASE));

    ElfImage::executable(EXE_BASE)
        .entry(MAIN)
        .debug(R_DEBUG)
        .function("foo", FOO)
        .function("thumb_add", THUMB_ADD)
        .function("main", MAIN)
        .load(host, pid);

    let libc = LIBC_FUNCS
        .iter()
        .fold(ElfImage::shared(LIBC_BASE), |img, name| img.function(name, libc_addr(name)));
    libc.load(host, pid);
    let ld = ElfImage::shared(LD_BASE).function("_dl_debug_state", LD_DEBUG_STATE);
    ld.load(host, pid);

    link_map(
        host,
        pid,
        R_DEBUG,
        LD_BASE,
        &[
            (LIBC_BASE, "/lib/libc.so.6", libc.dynamic_addr()),
            (LD_BASE, "/lib/ld-linux.so.3", ld.dynamic_addr()),
        ],
    );

    for word in [(FOO, 0xe92d_4010), (FOO + 4, 0xe280_0001), (FOO + 8, 0xe8bd_8010)] {
        host.poke_u32(pid, word.0, word.1);
    }
    for (i, hw) in [0xb510u16, 0x3001, 0xbd10].iter().enumerate() {
        host.poke_u16(pid, (THUMB_ADD & !1) + 2 * i as u32, *hw);
    }
    let main = [
        0xe3a0_0029, // mov r0, #41
        0xebff_ff7d, // bl foo
        0xe1a0_1000, // mov r1, r0
        0xeaff_fffe, // b .
        0xe3a0_0029, // mov r0, #41
        0xfaff_ffb9, // blx thumb_add
        0xe1a0_1000, // mov r1, r0
        0xeaff_fffe, // b .
    ];
    for (i, word) in main.iter().enumerate() {
        host.poke_u32(pid, MAIN + 4 * i as u32, *word);
    }
    for name in LIBC_FUNCS {
        host.poke_u32(pid, libc_addr(name), 0xe3a0_0000);
        host.poke_u32(pid, libc_addr(name) + 4, 0xe12f_ff1e);
    }
    host.poke_u32(pid, LD_DEBUG_STATE, 0xe12f_ff1e);

    host.map(pid, STACK_TOP - 0x4000, 0x4000);
}

pub fn arm_regs(pc: u32) -> Regs {
    let mut regs = Regs::default();
    regs.cpsr = 0x10;
    regs.r[13] = STACK_TOP;
    regs.set_pc(pc);
    regs
}

pub fn thumb_regs(pc: u32) -> Regs {
    let mut regs = arm_regs(pc & !1);
    regs.cpsr |= CPSR_T;
    regs
}

/// A host, a registry and the settings a dispatcher is built from.
pub struct Harness {
    pub host: MockHost,
    pub registry: Registry,
    pub config: SessionConfig,
    pub defaults: Vec<FunctionHook>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            host: MockHost::new(),
            registry: Registry::new(),
            config: SessionConfig {
                builtin_hooks: false,
                ..SessionConfig::default()
            },
            defaults: Vec::new(),
        }
    }

    pub fn dispatcher(&mut self) -> Dispatcher<'_> {
        Dispatcher::new(&mut self.registry, &self.host, &self.config).with_default_hooks(&self.defaults)
    }

    /// Execute `tid` until its PC reaches `until`, feeding traps to the
    /// dispatcher. Returns the outcome of every trap taken.
    pub fn run(&mut self, tid: Pid, regs: &mut Regs, until: u32) -> Vec<TrapOutcome> {
        let tgid = self.host.thread_group(tid).unwrap();
        let cpu = Cpu {
            host: &self.host,
            pid: tgid,
        };
        let mut dispatcher =
            Dispatcher::new(&mut self.registry, &self.host, &self.config).with_default_hooks(&self.defaults);
        let mut outcomes = Vec::new();
        for _ in 0..1000 {
            if regs.pc() == until {
                return outcomes;
            }
            if let Step::Trap(insn) = cpu.step(regs) {
                let outcome = dispatcher.handle_trap(tid, regs, insn);
                assert_ne!(outcome, TrapOutcome::Unhandled, "unhandled trap {:#x} at {:#x}", insn, regs.pc());
                outcomes.push(outcome);
            }
        }
        panic!("{} never reached {:#x}, stuck at {:#x}", tid, until, regs.pc());
    }
}
