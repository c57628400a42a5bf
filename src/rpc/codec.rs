// Length-prefixed framing: u32 big-endian body length, then the JSON body.
// The length is validated against MAX_FRAME before any allocation happens.

use super::MAX_FRAME;
use crate::error::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read one frame body. Returns `Ok(None)` on a clean EOF at a frame
/// boundary (peer hung up).
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::net(format!("read error: {}", e))),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(Error::bad_request(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::net(format!("read error mid-frame: {}", e)))?;
    Ok(Some(body))
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME {
        return Err(Error::bad_request(format!(
            "refusing to send {} byte frame",
            body.len()
        )));
    }
    writer
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .map_err(|e| Error::net(format!("write error: {}", e)))?;
    writer
        .write_all(body)
        .await
        .map_err(|e| Error::net(format!("write error: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::net(format!("flush error: {}", e)))?;
    Ok(())
}

/// Serialize a value and send it as one frame.
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let body = serde_json::to_vec(value)
        .map_err(|e| Error::bad_request(format!("failed to encode frame: {}", e)))?;
    write_frame(writer, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"{\"id\":1}").await.unwrap();
        let body = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(body, b"{\"id\":1}");
    }

    #[tokio::test]
    async fn fragmented_frames_reassemble() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = b"0123456789abcdef";
        let mut wire = (body.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(body);

        let writer = tokio::spawn(async move {
            // Drip the frame out in 3-byte slices.
            for chunk in wire.chunks(3) {
                a.write_all(chunk).await.unwrap();
                a.flush().await.unwrap();
                tokio::task::yield_now().await;
            }
            a
        });

        let got = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(got, body);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_read() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Announce 20 MiB but send nothing else.
        a.write_all(&(20u32 * 1024 * 1024).to_be_bytes()).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn eof_at_boundary_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn two_frames_in_sequence() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"second").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"second");
    }
}
