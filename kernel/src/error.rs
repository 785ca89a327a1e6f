//! Kernel-wide error types.
//!
//! All kernel paths report failure through these enums; nothing panics
//! across a subsystem boundary except the fatal cases the design calls out
//! (frame exhaustion, kernel-mode faults, broken invariants).

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    InvalidAddress {
        addr: u64,
    },
    UnmappedMemory {
        addr: u64,
    },
    AlreadyMapped {
        addr: u64,
    },

    /// Scheduler errors
    Sched(SchedError),

    /// Message-bus errors
    Amc(AmcError),

    /// Driver-interface errors
    Adi(AdiError),

    /// Program-loader errors
    Elf(ElfError),

    /// System call errors
    Syscall(SyscallError),

    /// Ramdisk errors
    Initrd(InitrdError),

    /// Generic errors
    InvalidArgument {
        name: &'static str,
    },
    AlreadyExists {
        resource: &'static str,
    },
    NotFound {
        resource: &'static str,
    },
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Errors from the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// No live task with this pid
    TaskNotFound { pid: u32 },
    /// The target task's state does not permit the operation
    WrongState,
}

/// Errors from the AMC message bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmcError {
    /// Destination service has not registered
    ServiceNotFound,
    /// The name is already bound to another task
    NameInUse,
    /// The calling task already owns a service registration
    AlreadyRegistered,
    /// Service name exceeds the 64-byte limit or is empty
    InvalidName,
    /// Message body exceeds the frame payload size
    BodyTooLarge,
    /// Destination inbox is at its depth cap
    InboxFull,
    /// The named peer has no address space to map into
    NoAddressSpace,
}

/// Errors from the driver interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdiError {
    /// Vector outside the delegated IRQ window
    InvalidVector,
    /// Another task already owns this vector
    VectorInUse,
    /// Caller is not the registered owner of the vector
    NotOwner,
}

/// Errors from the ELF loader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// File too small to hold a header
    Truncated,
    /// Bad magic bytes
    BadMagic,
    /// Not a 64-bit little-endian ELF
    UnsupportedClass,
    /// Machine field is not x86_64
    UnsupportedMachine,
    /// Dynamic or relocatable object, not a static executable
    NotExecutable,
    /// A program header points outside the file
    SegmentOutOfBounds,
    /// filesz exceeds memsz
    InvalidSegment,
}

/// Errors from the syscall gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Call number outside the dispatch table
    UnknownSyscall,
    /// A pointer argument is not a valid user address
    BadUserPointer,
}

/// Errors from the ramdisk parser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitrdError {
    /// Archive too small for its own header table
    Truncated,
    /// A file header's magic byte is not 0xBF
    BadMagic,
    /// nfiles exceeds the 64-entry cap baked into the format
    TooManyFiles,
    /// A file's data range lies outside the archive
    FileOutOfBounds,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::InvalidAddress { addr } => {
                write!(f, "invalid address {addr:#x}")
            }
            KernelError::UnmappedMemory { addr } => {
                write!(f, "address {addr:#x} is not mapped")
            }
            KernelError::AlreadyMapped { addr } => {
                write!(f, "address {addr:#x} is already mapped")
            }
            KernelError::Sched(e) => write!(f, "sched: {e:?}"),
            KernelError::Amc(e) => write!(f, "amc: {e:?}"),
            KernelError::Adi(e) => write!(f, "adi: {e:?}"),
            KernelError::Elf(e) => write!(f, "elf: {e:?}"),
            KernelError::Syscall(e) => write!(f, "syscall: {e:?}"),
            KernelError::Initrd(e) => write!(f, "initrd: {e:?}"),
            KernelError::InvalidArgument { name } => {
                write!(f, "invalid argument: {name}")
            }
            KernelError::AlreadyExists { resource } => {
                write!(f, "{resource} already exists")
            }
            KernelError::NotFound { resource } => write!(f, "{resource} not found"),
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{subsystem} not initialized")
            }
        }
    }
}

impl From<SchedError> for KernelError {
    fn from(e: SchedError) -> Self {
        KernelError::Sched(e)
    }
}

impl From<AmcError> for KernelError {
    fn from(e: AmcError) -> Self {
        KernelError::Amc(e)
    }
}

impl From<AdiError> for KernelError {
    fn from(e: AdiError) -> Self {
        KernelError::Adi(e)
    }
}

impl From<ElfError> for KernelError {
    fn from(e: ElfError) -> Self {
        KernelError::Elf(e)
    }
}

impl From<SyscallError> for KernelError {
    fn from(e: SyscallError) -> Self {
        KernelError::Syscall(e)
    }
}

impl From<InitrdError> for KernelError {
    fn from(e: InitrdError) -> Self {
        KernelError::Initrd(e)
    }
}
