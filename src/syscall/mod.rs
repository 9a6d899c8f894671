//! Implementation of the emulated memory syscalls
//!
//! The enclave application enters the runtime through the trap
//! layer (an external collaborator), which forwards each system
//! call here with its RISC-V Linux number. Only the dynamic-memory
//! calls are emulated by this core; everything else is rejected
//! with -1.

/// brk syscall
const SYSCALL_BRK: usize = 214;
/// munmap syscall
const SYSCALL_MUNMAP: usize = 215;
/// mmap syscall
const SYSCALL_MMAP: usize = 222;
/// mprotect syscall
const SYSCALL_MPROTECT: usize = 226;

mod mem;

pub use mem::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};
use mem::*;

/// handle syscall exception with `syscall_id` and other arguments
pub fn syscall(syscall_id: usize, args: [usize; 6]) -> isize {
    match syscall_id {
        SYSCALL_BRK => sys_brk(args[0]),
        SYSCALL_MUNMAP => sys_munmap(args[0], args[1]),
        SYSCALL_MMAP => sys_mmap(
            args[0],
            args[1],
            args[2],
            args[3],
            args[4] as isize,
            args[5],
        ),
        SYSCALL_MPROTECT => sys_mprotect(args[0], args[1], args[2]),
        _ => {
            warn!("cannot handle syscall {}, FAILING = -1", syscall_id);
            -1
        }
    }
}
