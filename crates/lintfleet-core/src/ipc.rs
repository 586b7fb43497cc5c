//! The master/worker IPC channel.
//!
//! Messages are length-delimited JSON records over a Unix socket pair. The
//! master keeps one end; the other is installed as fd 3 in the child before
//! exec, so stdout and stderr stay inherited for human-readable logging and
//! the protocol has a channel of its own.

use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{CoreError, CoreResult};

/// The fd number the worker end of the channel is installed at.
pub const WORKER_FD: RawFd = 3;

/// Result frames can carry a whole batch of diagnostic records.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub type IpcFramed = Framed<UnixStream, LengthDelimitedCodec>;
pub type IpcSink = SplitSink<IpcFramed, Bytes>;
pub type IpcStream = SplitStream<IpcFramed>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// Wrap a connected stream in the length-delimited framing.
pub fn frame(stream: UnixStream) -> IpcFramed {
    Framed::new(stream, codec())
}

/// Encode a message and send it as one frame.
pub async fn send_frame<T: Serialize>(sink: &mut IpcSink, msg: &T) -> CoreResult<()> {
    let body = serde_json::to_vec(msg).map_err(CoreError::Codec)?;
    sink.send(Bytes::from(body)).await.map_err(CoreError::Ipc)
}

/// Receive and decode the next frame. `Ok(None)` means the peer closed.
pub async fn next_frame<T: DeserializeOwned>(stream: &mut IpcStream) -> CoreResult<Option<T>> {
    match stream.next().await {
        None => Ok(None),
        Some(Err(e)) => Err(CoreError::Ipc(e)),
        Some(Ok(buf)) => serde_json::from_slice(&buf)
            .map(Some)
            .map_err(CoreError::Codec),
    }
}

/// A socket pair connecting the master to one worker-to-be.
pub struct WorkerChannel {
    master: UnixStream,
    child: StdUnixStream,
}

impl WorkerChannel {
    /// Create the pair. The master end is registered with the tokio
    /// reactor immediately; the child end stays a plain blocking socket
    /// until it crosses the exec boundary.
    pub fn pair() -> CoreResult<Self> {
        let (master, child) = StdUnixStream::pair().map_err(CoreError::Ipc)?;
        master.set_nonblocking(true).map_err(CoreError::Ipc)?;
        let master = UnixStream::from_std(master).map_err(CoreError::Ipc)?;
        Ok(Self { master, child })
    }

    /// Split into the framed master side and the raw child end.
    ///
    /// The caller must keep the child end alive until the worker has been
    /// spawned, then drop it so the only open handle lives in the child.
    pub fn into_parts(self) -> (IpcFramed, StdUnixStream) {
        (frame(self.master), self.child)
    }
}

/// Arrange for `child_end` to appear as [`WORKER_FD`] in the spawned child.
///
/// `dup2` onto a fixed fd clears close-on-exec, which is exactly what lets
/// the socket survive into the worker. The equal-fd case has to clear the
/// flag by hand because `dup2(n, n)` is a no-op.
pub fn wire_child(cmd: &mut tokio::process::Command, child_end: &StdUnixStream) {
    let fd = child_end.as_raw_fd();
    // SAFETY: the closure runs between fork and exec and only calls
    // async-signal-safe libc functions.
    unsafe {
        cmd.pre_exec(move || {
            if fd == WORKER_FD {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(fd, WORKER_FD) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Open the worker's end of the channel from [`WORKER_FD`].
///
/// Must only be called once, in worker mode, where the master installed
/// the socket before exec.
pub fn worker_stream() -> CoreResult<IpcFramed> {
    // SAFETY: in worker mode fd 3 is the channel installed by the master;
    // nothing else in the process owns it.
    let std_stream = unsafe { StdUnixStream::from_raw_fd(WORKER_FD) };
    std_stream.set_nonblocking(true).map_err(CoreError::Ipc)?;
    let stream = UnixStream::from_std(std_stream).map_err(CoreError::Ipc)?;
    Ok(frame(stream))
}
