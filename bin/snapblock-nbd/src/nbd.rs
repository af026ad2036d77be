//! NBD (Network Block Device) fixed newstyle server
//!
//! Serves exactly one read-only export backed by a [`Backend`]. Clients
//! select it with `NBD_OPT_GO` (or the legacy `NBD_OPT_EXPORT_NAME`); an
//! empty export name selects it too.
//!
//! In the transmission phase each read runs as its own task, so a slow
//! remote fetch does not hold up later requests on the same connection.
//! Replies are simple replies written under a lock on the write half and
//! may arrive out of order; clients match them by handle.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use snapblock_block::{Backend, BlockError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::UnixListener;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// ── NBD protocol constants ────────────────────────────────────────────────────

const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
const NBD_IHAVEOPT: u64 = 0x4948_4156_454f_5054; // "IHAVEOPT"
const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
const NBD_REPLY_MAGIC: u32 = 0x6744_6698;

// Handshake flags
const NBD_FLAG_FIXED_NEWSTYLE: u16 = 0x0001;
const NBD_FLAG_NO_ZEROES: u16 = 0x0002;

// Client flags
const NBD_FLAG_C_NO_ZEROES: u32 = 0x0002;

// Option IDs
const NBD_OPT_EXPORT_NAME: u32 = 1;
const NBD_OPT_ABORT: u32 = 2;
const NBD_OPT_LIST: u32 = 3;
const NBD_OPT_INFO: u32 = 6;
const NBD_OPT_GO: u32 = 7;

// Reply types
const NBD_REP_ACK: u32 = 1;
const NBD_REP_SERVER: u32 = 2;
const NBD_REP_INFO: u32 = 3;
const NBD_REP_ERR_UNSUP: u32 = 0x8000_0001;
const NBD_REP_ERR_INVALID: u32 = 0x8000_0003;
const NBD_REP_ERR_UNKNOWN: u32 = 0x8000_0006;
const NBD_REP_ERR_SHUTDOWN: u32 = 0x8000_0007;

// Transmission flags
const NBD_FLAG_HAS_FLAGS: u16 = 0x0001;
const NBD_FLAG_READ_ONLY: u16 = 0x0002;
const NBD_FLAG_SEND_FLUSH: u16 = 0x0004;
const NBD_FLAG_SEND_FUA: u16 = 0x0008;

// Info types
const NBD_INFO_EXPORT: u16 = 0;
const NBD_INFO_BLOCK_SIZE: u16 = 3;

// Commands
const NBD_CMD_READ: u16 = 0;
const NBD_CMD_WRITE: u16 = 1;
const NBD_CMD_DISC: u16 = 2;
const NBD_CMD_FLUSH: u16 = 3;
const NBD_CMD_TRIM: u16 = 4;

// Command flags
const NBD_CMD_FLAG_FUA: u16 = 0x0001;

// Error values
const NBD_EPERM: u32 = 1;
const NBD_EIO: u32 = 5;
const NBD_EINVAL: u32 = 22;
const NBD_ESHUTDOWN: u32 = 108;

/// Largest option payload accepted during negotiation
const MAX_OPTION_DATA: u32 = 64 * 1024;
/// Largest read or write payload accepted per request
const MAX_REQUEST_BYTES: u32 = 32 * 1024 * 1024;
/// Reads in flight per connection
const MAX_INFLIGHT_READS: usize = 16;

/// NBD errno for a backend error
pub fn errno(err: &BlockError) -> u32 {
    match err {
        BlockError::NotSupported(_) => NBD_EPERM,
        BlockError::OutOfBounds { .. } => NBD_EINVAL,
        BlockError::Cancelled | BlockError::Closed | BlockError::Terminated(_) => NBD_ESHUTDOWN,
        _ => NBD_EIO,
    }
}

/// Outcome of option haggling
enum Negotiated {
    /// Enter the transmission phase
    Transmission,
    /// Client aborted or the export went away
    Disconnect,
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct NbdServer {
    export_name: String,
    backend: Arc<dyn Backend>,
    connections: AtomicU64,
}

impl NbdServer {
    pub fn new(export_name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            export_name: export_name.into(),
            backend,
            connections: AtomicU64::new(0),
        }
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn serve(
        self: Arc<Self>,
        listener: UnixListener,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        info!("NBD: serving export '{}'", self.export_name);

        loop {
            let accepted = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                res = listener.accept() => res,
            };
            match accepted {
                Ok((stream, _addr)) => {
                    let id = self.connections.fetch_add(1, Ordering::Relaxed);
                    let peer = format!("conn-{id}");
                    let server = Arc::clone(&self);
                    let ctx = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_client(stream, &peer, ctx).await {
                            warn!("NBD: client {peer} error: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("NBD: accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }

        info!("NBD: listener stopped");
        Ok(())
    }

    /// Run one client connection to completion.
    ///
    /// `ctx` is cancelled when the connection ends, which cancels any backend
    /// read still waiting on its behalf.
    pub async fn handle_client<S>(
        &self,
        stream: S,
        peer: &str,
        ctx: CancellationToken,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let _cancel_on_exit = ctx.clone().drop_guard();
        let mut stream = BufStream::new(stream);
        info!("NBD: client {peer} connected");

        // ── Handshake ─────────────────────────────────────────────────────────
        // Server → Client: NBDMAGIC + IHAVEOPT + handshake_flags
        stream.write_u64(NBD_MAGIC).await?;
        stream.write_u64(NBD_IHAVEOPT).await?;
        stream
            .write_u16(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES)
            .await?;
        stream.flush().await?;

        // Client → Server: client_flags (4 bytes)
        let client_flags = stream.read_u32().await?;

        // ── Option negotiation ────────────────────────────────────────────────
        match self.negotiate_options(&mut stream, client_flags).await? {
            Negotiated::Transmission => {}
            Negotiated::Disconnect => {
                info!("NBD: client {peer} left during negotiation");
                return Ok(());
            }
        }

        // ── Data phase ────────────────────────────────────────────────────────
        let (mut reader, writer) = tokio::io::split(stream);
        self.data_phase(&mut reader, Arc::new(Mutex::new(writer)), peer, &ctx)
            .await?;

        info!("NBD: client {peer} disconnected from '{}'", self.export_name);
        Ok(())
    }

    fn is_our_export(&self, name: &str) -> bool {
        name.is_empty() || name == self.export_name
    }

    /// Size and transmission flags advertised for the export
    fn export_info(&self) -> Result<(u64, u16), BlockError> {
        let geometry = self.backend.geometry()?;
        let mut flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_READ_ONLY;
        if self.backend.has_flush() {
            flags |= NBD_FLAG_SEND_FLUSH;
        }
        if self.backend.has_fua() {
            flags |= NBD_FLAG_SEND_FUA;
        }
        Ok((geometry.size, flags))
    }

    async fn negotiate_options<S>(
        &self,
        stream: &mut S,
        client_flags: u32,
    ) -> anyhow::Result<Negotiated>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            // Read option header: IHAVEOPT magic (8) + option (4) + length (4)
            let magic = stream.read_u64().await?;
            if magic != NBD_IHAVEOPT {
                return Err(anyhow::anyhow!("bad option magic: {magic:#x}"));
            }
            let option = stream.read_u32().await?;
            let data_len = stream.read_u32().await?;
            if data_len > MAX_OPTION_DATA {
                return Err(anyhow::anyhow!("option {option} data too large: {data_len}"));
            }

            let mut option_data = vec![0u8; data_len as usize];
            stream.read_exact(&mut option_data).await?;

            match option {
                NBD_OPT_ABORT => {
                    self.send_option_reply(stream, option, NBD_REP_ACK, &[])
                        .await?;
                    return Ok(Negotiated::Disconnect);
                }

                NBD_OPT_LIST => {
                    let name_bytes = self.export_name.as_bytes();
                    let mut reply_data = Vec::with_capacity(4 + name_bytes.len());
                    reply_data.extend_from_slice(&(name_bytes.len() as u32).to_be_bytes());
                    reply_data.extend_from_slice(name_bytes);
                    self.send_option_reply(stream, option, NBD_REP_SERVER, &reply_data)
                        .await?;
                    self.send_option_reply(stream, option, NBD_REP_ACK, &[])
                        .await?;
                }

                NBD_OPT_INFO | NBD_OPT_GO => {
                    // u32 name_len + name_bytes + u16 num_info_requests + u16 each
                    let Some((name, requests)) = parse_info_request(&option_data) else {
                        self.send_option_reply(
                            stream,
                            option,
                            NBD_REP_ERR_INVALID,
                            b"malformed info request",
                        )
                        .await?;
                        continue;
                    };

                    if !self.is_our_export(&name) {
                        self.send_option_reply(
                            stream,
                            option,
                            NBD_REP_ERR_UNKNOWN,
                            b"export not found",
                        )
                        .await?;
                        continue;
                    }

                    let (size, flags) = match self.export_info() {
                        Ok(info) => info,
                        Err(e) => {
                            warn!("NBD: export '{name}' unavailable: {e}");
                            self.send_option_reply(
                                stream,
                                option,
                                NBD_REP_ERR_SHUTDOWN,
                                b"export unavailable",
                            )
                            .await?;
                            return Ok(Negotiated::Disconnect);
                        }
                    };

                    // NBD_INFO_EXPORT: u16 info_type + u64 size + u16 flags
                    let mut info = Vec::with_capacity(12);
                    info.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
                    info.extend_from_slice(&size.to_be_bytes());
                    info.extend_from_slice(&flags.to_be_bytes());
                    self.send_option_reply(stream, option, NBD_REP_INFO, &info)
                        .await?;

                    if requests.contains(&NBD_INFO_BLOCK_SIZE) {
                        let info = self.block_size_info()?;
                        self.send_option_reply(stream, option, NBD_REP_INFO, &info)
                            .await?;
                    }

                    self.send_option_reply(stream, option, NBD_REP_ACK, &[])
                        .await?;

                    if option == NBD_OPT_GO {
                        info!("NBD: export '{}' selected ({size}B)", self.export_name);
                        return Ok(Negotiated::Transmission);
                    }
                }

                NBD_OPT_EXPORT_NAME => {
                    // No option reply: size + flags, then straight to data phase
                    let name = String::from_utf8_lossy(&option_data).to_string();
                    if !self.is_our_export(&name) {
                        return Err(anyhow::anyhow!("export '{name}' not found"));
                    }
                    let (size, flags) = self.export_info()?;
                    stream.write_u64(size).await?;
                    stream.write_u16(flags).await?;
                    if client_flags & NBD_FLAG_C_NO_ZEROES == 0 {
                        stream.write_all(&[0u8; 124]).await?;
                    }
                    stream.flush().await?;
                    info!("NBD: export '{}' selected ({size}B)", self.export_name);
                    return Ok(Negotiated::Transmission);
                }

                _ => {
                    self.send_option_reply(stream, option, NBD_REP_ERR_UNSUP, b"unsupported")
                        .await?;
                }
            }
        }
    }

    /// NBD_INFO_BLOCK_SIZE payload.
    ///
    /// Reads are served at any alignment, so the minimum is 1; preferred
    /// and maximum follow the remote block size.
    fn block_size_info(&self) -> Result<Vec<u8>, BlockError> {
        let geometry = self.backend.geometry()?;
        let preferred = u32::try_from(geometry.preferred_block).unwrap_or(u32::MAX);
        let max = u32::try_from(geometry.max_block).unwrap_or(u32::MAX);

        let mut info = Vec::with_capacity(14);
        info.extend_from_slice(&NBD_INFO_BLOCK_SIZE.to_be_bytes());
        info.extend_from_slice(&1u32.to_be_bytes());
        info.extend_from_slice(&preferred.to_be_bytes());
        info.extend_from_slice(&max.to_be_bytes());
        Ok(info)
    }

    async fn send_option_reply<S>(
        &self,
        stream: &mut S,
        option: u32,
        reply_type: u32,
        data: &[u8],
    ) -> anyhow::Result<()>
    where
        S: AsyncWrite + Unpin + Send,
    {
        stream.write_u64(NBD_OPTION_REPLY_MAGIC).await?;
        stream.write_u32(option).await?;
        stream.write_u32(reply_type).await?;
        stream.write_u32(data.len() as u32).await?;
        if !data.is_empty() {
            stream.write_all(data).await?;
        }
        stream.flush().await?;
        Ok(())
    }

    async fn data_phase<R, W>(
        &self,
        reader: &mut R,
        writer: Arc<Mutex<W>>,
        peer: &str,
        ctx: &CancellationToken,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut reads = JoinSet::new();
        let inflight = Arc::new(Semaphore::new(MAX_INFLIGHT_READS));

        loop {
            // A read whose reply could not be written ends the connection
            while let Some(res) = reads.try_join_next() {
                res??;
            }

            // Read request header: magic(4) + flags(2) + type(2) + handle(8) + offset(8) + length(4) = 28 bytes
            let magic = tokio::select! {
                biased;
                () = ctx.cancelled() => {
                    info!("NBD: closing client {peer} on shutdown");
                    break;
                }
                res = reader.read_u32() => res?,
            };
            if magic != NBD_REQUEST_MAGIC {
                return Err(anyhow::anyhow!("bad request magic: {magic:#x}"));
            }
            let flags = reader.read_u16().await?;
            let cmd = reader.read_u16().await?;
            let handle = reader.read_u64().await?;
            let offset = reader.read_u64().await?;
            let length = reader.read_u32().await?;

            match cmd {
                NBD_CMD_READ => {
                    if length > MAX_REQUEST_BYTES {
                        warn!("NBD: read of {length}B from {peer} exceeds limit");
                        send_reply(&writer, handle, NBD_EINVAL).await?;
                        continue;
                    }
                    let permit = Arc::clone(&inflight).acquire_owned().await?;
                    let backend = Arc::clone(&self.backend);
                    let writer = Arc::clone(&writer);
                    let ctx = ctx.clone();
                    let peer = peer.to_string();
                    reads.spawn(async move {
                        let _permit = permit;
                        serve_read(backend.as_ref(), &writer, &ctx, &peer, handle, offset, length)
                            .await
                    });
                }

                NBD_CMD_WRITE => {
                    // The payload is always consumed to keep the stream in sync
                    if length > MAX_REQUEST_BYTES {
                        let mut payload = (&mut *reader).take(u64::from(length));
                        tokio::io::copy(&mut payload, &mut tokio::io::sink()).await?;
                        send_reply(&writer, handle, NBD_EINVAL).await?;
                        continue;
                    }
                    let mut data = vec![0u8; length as usize];
                    reader.read_exact(&mut data).await?;

                    let fua = flags & NBD_CMD_FLAG_FUA != 0;
                    let error = match self.backend.write_at(ctx, &data, offset, fua).await {
                        Ok(_) => 0,
                        Err(e) => {
                            debug!("NBD: write rejected for {peer}: {e}");
                            errno(&e)
                        }
                    };
                    send_reply(&writer, handle, error).await?;
                }

                NBD_CMD_FLUSH => {
                    let error = match self.backend.flush(ctx).await {
                        Ok(()) => 0,
                        Err(e) => errno(&e),
                    };
                    send_reply(&writer, handle, error).await?;
                }

                NBD_CMD_TRIM => {
                    let error = match self.backend.trim_at(ctx, u64::from(length), offset).await {
                        Ok(_) => 0,
                        Err(e) => errno(&e),
                    };
                    send_reply(&writer, handle, error).await?;
                }

                NBD_CMD_DISC => {
                    info!("NBD: client {peer} sent disconnect for '{}'", self.export_name);
                    break;
                }

                _ => {
                    warn!("NBD: unknown command {cmd} from {peer}");
                    send_reply(&writer, handle, NBD_EINVAL).await?;
                }
            }
        }

        // Reads already accepted still get their replies
        while let Some(res) = reads.join_next().await {
            res??;
        }
        Ok(())
    }
}

/// Run one read request and write its reply
async fn serve_read<W>(
    backend: &dyn Backend,
    writer: &Mutex<W>,
    ctx: &CancellationToken,
    peer: &str,
    handle: u64,
    offset: u64,
    length: u32,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut data = vec![0u8; length as usize];
    match backend.read_at(ctx, &mut data, offset).await {
        Ok(_) => {
            // Reply: magic(4) + error(4) + handle(8) + data
            let mut w = writer.lock().await;
            w.write_u32(NBD_REPLY_MAGIC).await?;
            w.write_u32(0).await?; // no error
            w.write_u64(handle).await?;
            w.write_all(&data).await?;
            w.flush().await?;
            Ok(())
        }
        Err(e) => {
            warn!(
                "NBD: read error for {peer}: offset={offset} len={length} \
                 completed={} err={}",
                e.completed, e.error
            );
            send_reply(writer, handle, errno(&e.error)).await
        }
    }
}

/// Simple reply without payload
async fn send_reply<W>(writer: &Mutex<W>, handle: u64, error: u32) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut w = writer.lock().await;
    w.write_u32(NBD_REPLY_MAGIC).await?;
    w.write_u32(error).await?;
    w.write_u64(handle).await?;
    w.flush().await?;
    Ok(())
}

/// Parse `NBD_OPT_INFO` / `NBD_OPT_GO` data into the export name and the
/// requested info types
fn parse_info_request(data: &[u8]) -> Option<(String, Vec<u16>)> {
    let name_len = u32::from_be_bytes(data.get(..4)?.try_into().ok()?) as usize;
    let name = data.get(4..4 + name_len)?;
    let rest = &data[4 + name_len..];
    let count = u16::from_be_bytes(rest.get(..2)?.try_into().ok()?) as usize;
    let requests = rest.get(2..2 + 2 * count)?;
    if requests.len() + 2 != rest.len() {
        return None;
    }
    let requests = requests
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    Some((String::from_utf8_lossy(name).to_string(), requests))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use snapblock_block::{BlockResult, Geometry, PartialIo};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::io::DuplexStream;
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;

    const SIZE: u64 = 1 << 20;
    const BLOCK: u64 = 64 * 1024;

    /// In-memory device; bytes at or beyond `bad_from` fail to read, and
    /// reads starting at `gated_offset` wait for [`FakeBackend::release`]
    struct FakeBackend {
        data: Vec<u8>,
        bad_from: u64,
        terminated: AtomicBool,
        gated_offset: Option<u64>,
        gate: Notify,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                data: (0..SIZE).map(|i| (i % 251) as u8).collect(),
                bad_from: SIZE - BLOCK,
                terminated: AtomicBool::new(false),
                gated_offset: None,
                gate: Notify::new(),
            }
        }

        fn gated(offset: u64) -> Self {
            Self {
                gated_offset: Some(offset),
                ..Self::new()
            }
        }

        fn release(&self) {
            self.gate.notify_one();
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        async fn read_at(
            &self,
            _ctx: &CancellationToken,
            buf: &mut [u8],
            offset: u64,
        ) -> Result<usize, PartialIo> {
            if self.gated_offset == Some(offset) {
                self.gate.notified().await;
            }
            if self.terminated.load(Ordering::SeqCst) {
                return Err(BlockError::Terminated("metadata changed".into()).into());
            }
            let end = offset + buf.len() as u64;
            if end > SIZE {
                return Err(BlockError::OutOfBounds {
                    offset,
                    length: buf.len() as u64,
                    size: SIZE,
                }
                .into());
            }
            if end > self.bad_from {
                let completed = self.bad_from.saturating_sub(offset) as usize;
                return Err(PartialIo::new(
                    completed,
                    BlockError::ChecksumMismatch {
                        block: self.bad_from / BLOCK,
                    },
                ));
            }
            buf.copy_from_slice(&self.data[offset as usize..end as usize]);
            Ok(buf.len())
        }

        async fn write_at(
            &self,
            _ctx: &CancellationToken,
            _buf: &[u8],
            _offset: u64,
            _fua: bool,
        ) -> BlockResult<usize> {
            Err(BlockError::NotSupported("write"))
        }

        async fn trim_at(
            &self,
            _ctx: &CancellationToken,
            _length: u64,
            _offset: u64,
        ) -> BlockResult<usize> {
            Err(BlockError::NotSupported("trim"))
        }

        async fn flush(&self, _ctx: &CancellationToken) -> BlockResult<()> {
            Err(BlockError::NotSupported("flush"))
        }

        fn geometry(&self) -> BlockResult<Geometry> {
            Ok(Geometry {
                size: SIZE,
                min_block: BLOCK,
                preferred_block: BLOCK,
                max_block: BLOCK,
            })
        }

        fn has_fua(&self) -> bool {
            false
        }

        fn has_flush(&self) -> bool {
            false
        }

        async fn close(&self, _ctx: &CancellationToken) -> BlockResult<()> {
            Ok(())
        }
    }

    fn start(backend: Arc<FakeBackend>) -> (DuplexStream, JoinHandle<anyhow::Result<()>>) {
        let (client, server_side) = tokio::io::duplex(4 * 1024 * 1024);
        let server = NbdServer::new("ebs", backend);
        let task = tokio::spawn(async move {
            server
                .handle_client(server_side, "test", CancellationToken::new())
                .await
        });
        (client, task)
    }

    async fn handshake(client: &mut DuplexStream) {
        assert_eq!(client.read_u64().await.unwrap(), NBD_MAGIC);
        assert_eq!(client.read_u64().await.unwrap(), NBD_IHAVEOPT);
        let flags = client.read_u16().await.unwrap();
        assert_eq!(flags, NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES);
        client.write_u32(0x0001 | NBD_FLAG_C_NO_ZEROES).await.unwrap();
    }

    async fn send_option(client: &mut DuplexStream, option: u32, data: &[u8]) {
        client.write_u64(NBD_IHAVEOPT).await.unwrap();
        client.write_u32(option).await.unwrap();
        client.write_u32(data.len() as u32).await.unwrap();
        client.write_all(data).await.unwrap();
    }

    async fn read_option_reply(client: &mut DuplexStream) -> (u32, u32, Vec<u8>) {
        assert_eq!(client.read_u64().await.unwrap(), NBD_OPTION_REPLY_MAGIC);
        let option = client.read_u32().await.unwrap();
        let reply_type = client.read_u32().await.unwrap();
        let len = client.read_u32().await.unwrap();
        let mut data = vec![0u8; len as usize];
        client.read_exact(&mut data).await.unwrap();
        (option, reply_type, data)
    }

    fn info_request(name: &str, requests: &[u16]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&(name.len() as u32).to_be_bytes());
        data.extend_from_slice(name.as_bytes());
        data.extend_from_slice(&(requests.len() as u16).to_be_bytes());
        for r in requests {
            data.extend_from_slice(&r.to_be_bytes());
        }
        data
    }

    /// GO with the given name; returns (size, flags) from NBD_INFO_EXPORT
    async fn go(client: &mut DuplexStream, name: &str) -> (u64, u16) {
        send_option(client, NBD_OPT_GO, &info_request(name, &[])).await;
        let (option, reply_type, info) = read_option_reply(client).await;
        assert_eq!((option, reply_type), (NBD_OPT_GO, NBD_REP_INFO));
        assert_eq!(u16::from_be_bytes([info[0], info[1]]), NBD_INFO_EXPORT);
        let size = u64::from_be_bytes(info[2..10].try_into().unwrap());
        let flags = u16::from_be_bytes([info[10], info[11]]);
        let (_, reply_type, _) = read_option_reply(client).await;
        assert_eq!(reply_type, NBD_REP_ACK);
        (size, flags)
    }

    async fn send_request(
        client: &mut DuplexStream,
        cmd: u16,
        handle: u64,
        offset: u64,
        length: u32,
    ) {
        client.write_u32(NBD_REQUEST_MAGIC).await.unwrap();
        client.write_u16(0).await.unwrap();
        client.write_u16(cmd).await.unwrap();
        client.write_u64(handle).await.unwrap();
        client.write_u64(offset).await.unwrap();
        client.write_u32(length).await.unwrap();
    }

    /// Simple reply header: (error, handle)
    async fn read_reply(client: &mut DuplexStream) -> (u32, u64) {
        assert_eq!(client.read_u32().await.unwrap(), NBD_REPLY_MAGIC);
        let error = client.read_u32().await.unwrap();
        let handle = client.read_u64().await.unwrap();
        (error, handle)
    }

    async fn disconnect(mut client: DuplexStream, task: JoinHandle<anyhow::Result<()>>) {
        send_request(&mut client, NBD_CMD_DISC, 0, 0, 0).await;
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(errno(&BlockError::NotSupported("write")), NBD_EPERM);
        assert_eq!(
            errno(&BlockError::OutOfBounds {
                offset: 0,
                length: 1,
                size: 0
            }),
            NBD_EINVAL
        );
        assert_eq!(errno(&BlockError::Cancelled), NBD_ESHUTDOWN);
        assert_eq!(errno(&BlockError::Closed), NBD_ESHUTDOWN);
        assert_eq!(errno(&BlockError::Terminated("x".into())), NBD_ESHUTDOWN);
        assert_eq!(errno(&BlockError::ChecksumMismatch { block: 0 }), NBD_EIO);
        assert_eq!(errno(&BlockError::FetchAbandoned(3)), NBD_EIO);
    }

    #[test]
    fn test_parse_info_request() {
        let data = info_request("ebs", &[NBD_INFO_BLOCK_SIZE]);
        let (name, requests) = parse_info_request(&data).unwrap();
        assert_eq!(name, "ebs");
        assert_eq!(requests, vec![NBD_INFO_BLOCK_SIZE]);

        assert!(parse_info_request(&data[..5]).is_none());
        assert!(parse_info_request(&[0, 0, 0, 9, b'a']).is_none());
    }

    #[tokio::test]
    async fn test_list_exports() {
        let (mut client, task) = start(Arc::new(FakeBackend::new()));
        handshake(&mut client).await;

        send_option(&mut client, NBD_OPT_LIST, &[]).await;
        let (_, reply_type, data) = read_option_reply(&mut client).await;
        assert_eq!(reply_type, NBD_REP_SERVER);
        assert_eq!(&data[..4], &3u32.to_be_bytes());
        assert_eq!(&data[4..], b"ebs");
        let (_, reply_type, _) = read_option_reply(&mut client).await;
        assert_eq!(reply_type, NBD_REP_ACK);

        send_option(&mut client, NBD_OPT_ABORT, &[]).await;
        let (_, reply_type, _) = read_option_reply(&mut client).await;
        assert_eq!(reply_type, NBD_REP_ACK);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_go_advertises_read_only_export() {
        let (mut client, task) = start(Arc::new(FakeBackend::new()));
        handshake(&mut client).await;

        send_option(&mut client, NBD_OPT_GO, &info_request("other", &[])).await;
        let (_, reply_type, _) = read_option_reply(&mut client).await;
        assert_eq!(reply_type, NBD_REP_ERR_UNKNOWN);

        let (size, flags) = go(&mut client, "ebs").await;
        assert_eq!(size, SIZE);
        assert_eq!(flags, NBD_FLAG_HAS_FLAGS | NBD_FLAG_READ_ONLY);
        disconnect(client, task).await;
    }

    #[tokio::test]
    async fn test_info_reports_block_size_when_asked() {
        let (mut client, task) = start(Arc::new(FakeBackend::new()));
        handshake(&mut client).await;

        send_option(
            &mut client,
            NBD_OPT_INFO,
            &info_request("", &[NBD_INFO_BLOCK_SIZE]),
        )
        .await;
        let (_, reply_type, _) = read_option_reply(&mut client).await;
        assert_eq!(reply_type, NBD_REP_INFO);
        let (_, reply_type, info) = read_option_reply(&mut client).await;
        assert_eq!(reply_type, NBD_REP_INFO);
        assert_eq!(u16::from_be_bytes([info[0], info[1]]), NBD_INFO_BLOCK_SIZE);
        assert_eq!(u32::from_be_bytes(info[2..6].try_into().unwrap()), 1);
        assert_eq!(
            u32::from_be_bytes(info[6..10].try_into().unwrap()),
            BLOCK as u32
        );
        let (_, reply_type, _) = read_option_reply(&mut client).await;
        assert_eq!(reply_type, NBD_REP_ACK);

        // INFO does not end negotiation
        go(&mut client, "ebs").await;
        disconnect(client, task).await;
    }

    #[tokio::test]
    async fn test_export_name_option() {
        let (mut client, task) = start(Arc::new(FakeBackend::new()));
        handshake(&mut client).await;

        send_option(&mut client, NBD_OPT_EXPORT_NAME, b"ebs").await;
        assert_eq!(client.read_u64().await.unwrap(), SIZE);
        assert_eq!(
            client.read_u16().await.unwrap(),
            NBD_FLAG_HAS_FLAGS | NBD_FLAG_READ_ONLY
        );

        send_request(&mut client, NBD_CMD_READ, 1, 0, 16).await;
        let (error, handle) = read_reply(&mut client).await;
        assert_eq!((error, handle), (0, 1));
        let mut data = [0u8; 16];
        client.read_exact(&mut data).await.unwrap();
        assert_eq!(data.to_vec(), (0..16u8).collect::<Vec<_>>());
        disconnect(client, task).await;
    }

    #[tokio::test]
    async fn test_read_returns_device_bytes() {
        let backend = Arc::new(FakeBackend::new());
        let (mut client, task) = start(backend.clone());
        handshake(&mut client).await;
        go(&mut client, "ebs").await;

        let offset = BLOCK - 100;
        send_request(&mut client, NBD_CMD_READ, 42, offset, 4096).await;
        let (error, handle) = read_reply(&mut client).await;
        assert_eq!((error, handle), (0, 42));
        let mut data = vec![0u8; 4096];
        client.read_exact(&mut data).await.unwrap();
        assert_eq!(data, backend.data[offset as usize..offset as usize + 4096]);
        disconnect(client, task).await;
    }

    #[tokio::test]
    async fn test_read_errors_map_to_errno() {
        let backend = Arc::new(FakeBackend::new());
        let (mut client, task) = start(backend.clone());
        handshake(&mut client).await;
        go(&mut client, "ebs").await;

        send_request(&mut client, NBD_CMD_READ, 1, SIZE - 10, 20).await;
        assert_eq!(read_reply(&mut client).await, (NBD_EINVAL, 1));

        send_request(&mut client, NBD_CMD_READ, 2, SIZE - BLOCK - 10, 20).await;
        assert_eq!(read_reply(&mut client).await, (NBD_EIO, 2));

        backend.terminated.store(true, Ordering::SeqCst);
        send_request(&mut client, NBD_CMD_READ, 3, 0, 20).await;
        assert_eq!(read_reply(&mut client).await, (NBD_ESHUTDOWN, 3));

        disconnect(client, task).await;
    }

    #[tokio::test]
    async fn test_write_class_commands_rejected() {
        let (mut client, task) = start(Arc::new(FakeBackend::new()));
        handshake(&mut client).await;
        go(&mut client, "ebs").await;

        send_request(&mut client, NBD_CMD_WRITE, 7, 0, 512).await;
        client.write_all(&[0xAB; 512]).await.unwrap();
        assert_eq!(read_reply(&mut client).await, (NBD_EPERM, 7));

        send_request(&mut client, NBD_CMD_TRIM, 8, 0, 4096).await;
        assert_eq!(read_reply(&mut client).await, (NBD_EPERM, 8));

        send_request(&mut client, NBD_CMD_FLUSH, 9, 0, 0).await;
        assert_eq!(read_reply(&mut client).await, (NBD_EPERM, 9));

        // The write payload was consumed; the stream is still in sync
        send_request(&mut client, NBD_CMD_READ, 10, 0, 4).await;
        assert_eq!(read_reply(&mut client).await, (0, 10));
        let mut data = [0u8; 4];
        client.read_exact(&mut data).await.unwrap();
        assert_eq!(data, [0, 1, 2, 3]);

        send_request(&mut client, 99, 11, 0, 0).await;
        assert_eq!(read_reply(&mut client).await, (NBD_EINVAL, 11));

        disconnect(client, task).await;
    }

    #[tokio::test]
    async fn test_slow_read_does_not_block_later_reads() {
        let slow = 2 * BLOCK;
        let backend = Arc::new(FakeBackend::gated(slow));
        let (mut client, task) = start(backend.clone());
        handshake(&mut client).await;
        go(&mut client, "ebs").await;

        send_request(&mut client, NBD_CMD_READ, 1, slow, 8).await;
        send_request(&mut client, NBD_CMD_READ, 2, 0, 8).await;

        // The second read is answered while the first is still waiting
        let reply = tokio::time::timeout(Duration::from_secs(5), read_reply(&mut client))
            .await
            .unwrap();
        assert_eq!(reply, (0, 2));
        let mut data = [0u8; 8];
        client.read_exact(&mut data).await.unwrap();
        assert_eq!(data.to_vec(), backend.data[..8]);

        backend.release();
        assert_eq!(read_reply(&mut client).await, (0, 1));
        client.read_exact(&mut data).await.unwrap();
        assert_eq!(
            data.to_vec(),
            backend.data[slow as usize..slow as usize + 8]
        );

        disconnect(client, task).await;
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_inflight_reads() {
        let backend = Arc::new(FakeBackend::gated(0));
        let (mut client, mut task) = start(backend.clone());
        handshake(&mut client).await;
        go(&mut client, "ebs").await;

        send_request(&mut client, NBD_CMD_READ, 5, 0, 4).await;
        send_request(&mut client, NBD_CMD_DISC, 6, 0, 0).await;

        let pending = tokio::time::timeout(Duration::from_millis(50), &mut task).await;
        assert!(pending.is_err());

        backend.release();
        assert_eq!(read_reply(&mut client).await, (0, 5));
        let mut data = [0u8; 4];
        client.read_exact(&mut data).await.unwrap();
        assert_eq!(data, [0, 1, 2, 3]);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_request_magic_ends_connection() {
        let (mut client, task) = start(Arc::new(FakeBackend::new()));
        handshake(&mut client).await;
        go(&mut client, "ebs").await;

        client.write_u32(0xdead_beef).await.unwrap();
        assert!(task.await.unwrap().is_err());
    }
}
