//! Framed connections over async byte streams.
//!
//! Each frame is a 4-byte little-endian length followed by the payload.
//! A connection runs one receive task and one send task, exposed through
//! separate receiver and sender halves like a socket pair.

use std::time::Duration;

use log::{debug, warn};
use smol_str::SmolStr;
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::{
   config::BluetoothConfig,
   error::{Result, TransportError},
};

pub type Frame = Vec<u8>;

/// Size of the length prefix preceding every frame.
const HEADER_LEN: usize = 4;
/// Frames at most this long are logged in full at debug level.
const LOG_PREVIEW_LEN: usize = 64;

/// Limits applied to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
   pub max_frame_size: usize,
   pub write_timeout: Duration,
   pub queue_depth: usize,
}

impl Default for FrameLimits {
   fn default() -> Self {
      Self::from(&BluetoothConfig::default())
   }
}

impl From<&BluetoothConfig> for FrameLimits {
   fn from(config: &BluetoothConfig) -> Self {
      Self {
         max_frame_size: config.max_frame_size,
         write_timeout: config.write_timeout(),
         queue_depth: config.queue_depth.max(1),
      }
   }
}

enum Command {
   Send {
      data: Frame,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Receiver half of a connection.
#[derive(Debug)]
pub struct FrameReceiver {
   rx: mpsc::Receiver<Result<Frame>>,
}

impl FrameReceiver {
   pub async fn recv(&mut self) -> Result<Frame> {
      self.rx.recv().await.ok_or(TransportError::ConnectionClosed)?
   }
}

/// Sender half of a connection.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct FrameSender {
   tx: mpsc::Sender<Command>,
   limits: FrameLimits,
}

impl FrameSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if data.len() > self.limits.max_frame_size {
         return Err(TransportError::FrameTooLarge {
            size: data.len(),
            max: self.limits.max_frame_size,
         });
      }
      if !self.is_connected() {
         return Err(TransportError::ConnectionClosed);
      }

      // The write timeout covers waiting for queue space as well as the write.
      time::timeout(self.limits.write_timeout, self.enqueue(data))
         .await
         .map_err(|_| TransportError::RequestTimeout)?
   }

   async fn enqueue(&self, data: &[u8]) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: data.to_vec(),
            then: tx,
         })
         .await
         .map_err(|_| TransportError::ConnectionClosed)?;
      rx.await.map_err(|_| TransportError::ConnectionClosed)?
   }
}

/// An established, framed connection to a peer.
///
/// Dropping the connection aborts its I/O tasks.
#[derive(Debug)]
pub struct Connection {
   peer: SmolStr,
   sender: FrameSender,
   receiver: FrameReceiver,
   jset: JoinSet<()>,
}

impl Connection {
   /// Starts the receive and send tasks for `stream`.
   pub fn spawn<S>(peer: impl Into<SmolStr>, stream: S, limits: FrameLimits) -> Self
   where
      S: AsyncRead + AsyncWrite + Send + 'static,
   {
      let peer = peer.into();
      let (reader, writer) = tokio::io::split(stream);
      let limits = FrameLimits {
         queue_depth: limits.queue_depth.max(1),
         ..limits
      };
      let (cmd_tx, cmd_rx) = mpsc::channel(limits.queue_depth);
      let (in_tx, in_rx) = mpsc::channel(limits.queue_depth);

      let mut jset = JoinSet::new();
      jset.spawn(recv_thread(peer.clone(), in_tx, reader, limits.max_frame_size));
      jset.spawn(send_thread(peer.clone(), cmd_rx, writer));

      debug!("Connection to {peer} established");
      Self {
         peer,
         sender: FrameSender { tx: cmd_tx, limits },
         receiver: FrameReceiver { rx: in_rx },
         jset,
      }
   }

   pub fn peer(&self) -> &str {
      &self.peer
   }

   pub fn sender(&self) -> FrameSender {
      self.sender.clone()
   }

   pub fn is_connected(&self) -> bool {
      self.sender.is_connected()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      self.sender.send(data).await
   }

   pub async fn recv(&mut self) -> Result<Frame> {
      self.receiver.recv().await
   }
}

impl Drop for Connection {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

/// Reads one frame. Returns `None` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Frame>>
where
   R: AsyncRead + Unpin,
{
   let mut header = [0u8; HEADER_LEN];
   if reader.read(&mut header[..1]).await? == 0 {
      return Ok(None);
   }
   // EOF past the first header byte is a truncated frame, not a clean close.
   reader.read_exact(&mut header[1..]).await?;

   let size = u32::from_le_bytes(header) as usize;
   if size > max_frame_size {
      return Err(TransportError::FrameTooLarge {
         size,
         max: max_frame_size,
      });
   }

   let mut frame = vec![0u8; size];
   reader.read_exact(&mut frame).await?;
   Ok(Some(frame))
}

/// Writes one frame and flushes.
pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> Result<()>
where
   W: AsyncWrite + Unpin,
{
   let size = u32::try_from(data.len()).map_err(|_| TransportError::FrameTooLarge {
      size: data.len(),
      max: u32::MAX as usize,
   })?;
   writer.write_all(&size.to_le_bytes()).await?;
   writer.write_all(data).await?;
   writer.flush().await?;
   Ok(())
}

fn preview(data: &[u8]) -> String {
   if data.len() <= LOG_PREVIEW_LEN {
      hex::encode(data)
   } else {
      format!("{}… ({} bytes)", hex::encode(&data[..LOG_PREVIEW_LEN]), data.len())
   }
}

async fn recv_thread<S>(
   peer: SmolStr,
   tx: mpsc::Sender<Result<Frame>>,
   mut reader: ReadHalf<S>,
   max_frame_size: usize,
) where
   S: AsyncRead + AsyncWrite + Send,
{
   loop {
      match read_frame(&mut reader, max_frame_size).await {
         Ok(Some(frame)) => {
            debug!("← {peer}: {}", preview(&frame));
            if let Err(e) = tx.send(Ok(frame)).await {
               warn!("Failed to deliver frame from {peer}: {e:?}");
               return;
            }
         },
         Ok(None) => {
            warn!("Connection to {peer} lost");
            let _ = tx.send(Err(TransportError::ConnectionLost)).await;
            return;
         },
         Err(e) => {
            warn!("Failed to read from {peer}: {e}");
            let _ = tx.send(Err(e)).await;
            return;
         },
      }
   }
}

async fn send_thread<S>(peer: SmolStr, mut rx: mpsc::Receiver<Command>, mut writer: WriteHalf<S>)
where
   S: AsyncRead + AsyncWrite + Send,
{
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {peer}: {}", preview(&data));
            if let Err(e) = write_frame(&mut writer, &data).await {
               warn!("Failed to send data to {peer}: {e}");
               let _ = then.send(Err(e));
            } else {
               _ = then.send(Ok(()));
            }
         },
      }
   }
   debug!("Sender for {peer} shut down");
   let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
   use super::*;

   use tokio::io::duplex;

   fn limits(max_frame_size: usize) -> FrameLimits {
      FrameLimits {
         max_frame_size,
         write_timeout: Duration::from_secs(5),
         queue_depth: 8,
      }
   }

   #[tokio::test]
   async fn test_frames_cross_a_duplex_pair() -> Result<()> {
      let (a, b) = duplex(1024);
      let left = Connection::spawn("left", a, limits(256));
      let mut right = Connection::spawn("right", b, limits(256));

      left.send(b"hello").await?;
      left.send(&[]).await?;
      left.send(&[0xAB; 200]).await?;

      assert_eq!(right.recv().await?, b"hello".to_vec());
      assert!(right.recv().await?.is_empty());
      assert_eq!(right.recv().await?, vec![0xAB; 200]);
      assert_eq!(right.peer(), "right");
      Ok(())
   }

   #[tokio::test]
   async fn test_sender_rejects_oversized_frame() {
      let (a, _b) = duplex(64);
      let conn = Connection::spawn("peer", a, limits(16));

      let err = conn.send(&[0u8; 17]).await.unwrap_err();
      assert!(matches!(
         err,
         TransportError::FrameTooLarge { size: 17, max: 16 }
      ));
   }

   #[tokio::test]
   async fn test_receiver_rejects_oversized_header() {
      let (mut raw, b) = duplex(64);
      let mut conn = Connection::spawn("peer", b, limits(16));

      raw.write_all(&1000u32.to_le_bytes()).await.unwrap();
      let err = conn.recv().await.unwrap_err();
      assert!(matches!(
         err,
         TransportError::FrameTooLarge { size: 1000, max: 16 }
      ));
   }

   #[tokio::test]
   async fn test_peer_close_reports_connection_lost() {
      let (a, b) = duplex(64);
      let mut conn = Connection::spawn("peer", b, limits(64));
      drop(a);

      assert!(matches!(
         conn.recv().await,
         Err(TransportError::ConnectionLost)
      ));
   }

   #[tokio::test]
   async fn test_read_frame_truncated_payload_is_io_error() {
      let (mut w, mut r) = duplex(64);
      w.write_all(&8u32.to_le_bytes()).await.unwrap();
      w.write_all(b"abc").await.unwrap();
      drop(w);

      assert!(matches!(
         read_frame(&mut r, 64).await,
         Err(TransportError::Io(_))
      ));
   }

   #[tokio::test]
   async fn test_read_frame_truncated_header_is_io_error() {
      let (mut w, mut r) = duplex(64);
      w.write_all(&[1, 0]).await.unwrap();
      drop(w);

      assert!(matches!(
         read_frame(&mut r, 64).await,
         Err(TransportError::Io(_))
      ));
   }

   #[tokio::test]
   async fn test_send_times_out_when_queue_is_full() {
      // The peer never reads, so the writer blocks and the queue fills up.
      let (a, _stalled) = duplex(8);
      let conn = Connection::spawn(
         "peer",
         a,
         FrameLimits {
            max_frame_size: 1024,
            write_timeout: Duration::from_millis(100),
            queue_depth: 1,
         },
      );

      for i in 0..4 {
         let res = time::timeout(Duration::from_secs(2), conn.send(&[0x5A; 64]))
            .await
            .unwrap_or_else(|_| panic!("send {i} outlived its write timeout"));
         assert!(matches!(res, Err(TransportError::RequestTimeout)), "send {i}: {res:?}");
      }
   }

   #[tokio::test]
   async fn test_zero_queue_depth_is_clamped() -> Result<()> {
      let (a, b) = duplex(64);
      let zero = FrameLimits {
         queue_depth: 0,
         ..limits(64)
      };
      let left = Connection::spawn("left", a, zero);
      let mut right = Connection::spawn("right", b, zero);

      left.send(b"ok").await?;
      assert_eq!(right.recv().await?, b"ok".to_vec());
      Ok(())
   }

   #[tokio::test]
   async fn test_write_then_read_frame() -> Result<()> {
      let (mut w, mut r) = duplex(64);
      write_frame(&mut w, b"ping").await?;
      drop(w);

      assert_eq!(read_frame(&mut r, 64).await?, Some(b"ping".to_vec()));
      assert_eq!(read_frame(&mut r, 64).await?, None);
      Ok(())
   }
}
