use core::fmt;

/// The error code values used by [`Heap::posix_memalign`].
///
/// These come from `libc` on Unix targets. Elsewhere the newlib numbering is
/// used, which is what most bare-metal C toolchains ship.
///
/// [`Heap::posix_memalign`]: crate::Heap::posix_memalign
pub mod errno {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            /// Invalid argument.
            pub const EINVAL: i32 = libc::EINVAL;
            /// Not enough memory.
            pub const ENOMEM: i32 = libc::ENOMEM;
        } else {
            /// Invalid argument.
            pub const EINVAL: i32 = 22;
            /// Not enough memory.
            pub const ENOMEM: i32 = 12;
        }
    }
}

/// The reason an allocation request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocError {
    /// The size was zero, or the alignment was zero or not a power of two.
    InvalidArgument,
    /// No free block could hold the request.
    OutOfMemory,
}

impl AllocError {
    /// Get the POSIX error code corresponding to `self`.
    #[inline]
    pub const fn errno(self) -> i32 {
        match self {
            Self::InvalidArgument => errno::EINVAL,
            Self::OutOfMemory => errno::ENOMEM,
        }
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InvalidArgument => "invalid allocation size or alignment",
            Self::OutOfMemory => "out of memory",
        })
    }
}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for AllocError {}
