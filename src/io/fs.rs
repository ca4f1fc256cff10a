//! File requests.
//!
//! Files are opened with [open] or [create] and then read from and written to
//! at explicit offsets with [read] and [write]. Each call returns a
//! [Request] that can be chained, awaited or aborted.
//!
//! # Example
//!
//! Here is an example of creating a new file, writing the string
//! "Hello, world!" and reading it back.
//!
//! ```
//! use pledge::cancel::CancelToken;
//! use pledge::io;
//! use pledge::task::Executor;
//!# use assert_fs::TempDir;
//!# use assert_fs::fixture::PathChild;
//!# if io_uring::IoUring::new(2).is_err() { return; }
//!
//! Executor::block_on(async {
//!#     let dir = TempDir::new().unwrap();
//!#     let path = dir.child("test.txt").to_path_buf();
//!     let token = CancelToken::new();
//!     let file = io::create(&token, path).await?;
//!     io::write(&token, &file, 0, "Hello, world!").await?;
//!
//!     let bytes = io::read(&token, &file, 0, 1024).await?;
//!     assert_eq!(bytes, b"Hello, world!");
//!#     Ok::<(), pledge::deferred::Rejection<io::Errno>>(())
//! }).unwrap();
//! ```
use std::{
    ffi::CString,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    path::Path,
    rc::Rc,
};

use io_uring::{opcode, types};
use libc::{O_CLOEXEC, O_CREAT, O_RDWR};

use super::{submit, Errno};
use crate::{adapter::Request, cancel::CancelToken, deferred::RejectionSink};

/// An open file.
///
/// Cloning a file yields another handle to the same descriptor, which is
/// closed once the last handle (including those held by in-flight requests)
/// is dropped.
#[derive(Clone, Debug)]
pub struct File {
    inner: Rc<OwnedFd>,
}

impl AsFd for File {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

fn open_with(
    sink: &RejectionSink,
    token: &CancelToken,
    path: &Path,
    flags: i32,
) -> Request<File, Errno> {
    let Ok(path) = CString::new(path.as_os_str().as_encoded_bytes()) else {
        return Request::new_in(sink, token, |completion, _| {
            completion.fail(Errno(libc::EINVAL))
        });
    };

    let entry = opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), path.as_ptr())
        .flags(flags | O_CLOEXEC)
        .mode(0o666)
        .build();

    submit(sink, token, entry, move |result, completion| {
        drop(path);

        if result < 0 {
            completion.fail(Errno::from_result(result));
        } else {
            completion.succeed(File {
                inner: Rc::new(unsafe { OwnedFd::from_raw_fd(result) }),
            });
        }
    })
}

/// Open an existing file in read/write mode.
///
/// If the path does not exist the request rejects with `ENOENT`.
pub fn open(token: &CancelToken, path: impl AsRef<Path>) -> Request<File, Errno> {
    open_in(&RejectionSink::new(), token, path)
}

pub fn open_in(
    sink: &RejectionSink,
    token: &CancelToken,
    path: impl AsRef<Path>,
) -> Request<File, Errno> {
    open_with(sink, token, path.as_ref(), O_RDWR)
}

/// Open a file in read/write mode, creating it if it does not exist.
pub fn create(token: &CancelToken, path: impl AsRef<Path>) -> Request<File, Errno> {
    create_in(&RejectionSink::new(), token, path)
}

pub fn create_in(
    sink: &RejectionSink,
    token: &CancelToken,
    path: impl AsRef<Path>,
) -> Request<File, Errno> {
    open_with(sink, token, path.as_ref(), O_RDWR | O_CREAT)
}

/// Read up to `len` bytes starting at `offset`.
///
/// The request fulfils with the bytes read, which may be fewer than `len`
/// (and none at end of file).
pub fn read(token: &CancelToken, file: &File, offset: u64, len: usize) -> Request<Vec<u8>, Errno> {
    read_in(&RejectionSink::new(), token, file, offset, len)
}

pub fn read_in(
    sink: &RejectionSink,
    token: &CancelToken,
    file: &File,
    offset: u64,
    len: usize,
) -> Request<Vec<u8>, Errno> {
    let len = len.min(u32::MAX as usize);
    let mut buf = vec![0u8; len];
    let fd = file.inner.clone();

    let entry = opcode::Read::new(types::Fd(fd.as_raw_fd()), buf.as_mut_ptr(), len as u32)
        .offset(offset)
        .build();

    submit(sink, token, entry, move |result, completion| {
        drop(fd);

        if result < 0 {
            completion.fail(Errno::from_result(result));
        } else {
            buf.truncate(result as usize);
            completion.succeed(buf);
        }
    })
}

/// Write `data` starting at `offset`.
///
/// The request fulfils with the number of bytes written, which may be fewer
/// than `data.len()`.
pub fn write(
    token: &CancelToken,
    file: &File,
    offset: u64,
    data: impl Into<Vec<u8>>,
) -> Request<usize, Errno> {
    write_in(&RejectionSink::new(), token, file, offset, data)
}

pub fn write_in(
    sink: &RejectionSink,
    token: &CancelToken,
    file: &File,
    offset: u64,
    data: impl Into<Vec<u8>>,
) -> Request<usize, Errno> {
    let data = data.into();
    let fd = file.inner.clone();
    let len = data.len().min(u32::MAX as usize);

    let entry = opcode::Write::new(types::Fd(fd.as_raw_fd()), data.as_ptr(), len as u32)
        .offset(offset)
        .build();

    submit(sink, token, entry, move |result, completion| {
        drop((fd, data));

        if result < 0 {
            completion.fail(Errno::from_result(result));
        } else {
            completion.succeed(result as usize);
        }
    })
}
