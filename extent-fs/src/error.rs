use derive_more::Display;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[display(fmt = "invalid argument")]
    InvalidArgument,
    #[display(fmt = "bad file descriptor")]
    BadDescriptor,
    #[display(fmt = "no space left on volume")]
    OutOfSpace,
    #[display(fmt = "extent table holds at most {} extents", crate::MAX_EXTENTS)]
    TooManyExtents,
    #[display(fmt = "no such entry")]
    NotFound,
    #[display(fmt = "entry already exists")]
    AlreadyExists,
    #[display(fmt = "directory is full")]
    DirectoryFull,
    #[display(fmt = "directory is not empty")]
    DirectoryNotEmpty,
    #[display(fmt = "operation not permitted for this entry or open mode")]
    PermissionMismatch,
    #[display(fmt = "short block transfer")]
    DiskIo,
    #[display(fmt = "range overlaps free space")]
    Overlap,
    #[display(fmt = "too many open files")]
    TooManyOpenFiles,
    #[display(fmt = "directory is still in use")]
    Busy,
}

impl core::error::Error for Error {}
