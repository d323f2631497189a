//! Newline-delimited JSON over TCP: one request per line, one response line back.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use meetup_service::{Response, ServerContext, encode, handle_line};

/// How long blocking calls wait before re-checking the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const MSG_TOO_LARGE: &str = "Request too large";
const MSG_NOT_UTF8: &str = "Invalid request data";

/// Accept connections until shutdown is requested, one thread per connection.
pub fn serve(ctx: Arc<ServerContext>, listener: TcpListener) -> io::Result<()> {
    listener.set_nonblocking(true)?;
    let local = listener.local_addr()?;
    tracing::info!(%local, "listening");

    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    let mut next_id: u64 = 0;
    while !ctx.shutdown_requested() {
        match listener.accept() {
            Ok((stream, peer)) => {
                next_id += 1;
                let ctx = Arc::clone(&ctx);
                let handle = thread::Builder::new()
                    .name(format!("meetup-conn-{next_id}"))
                    .spawn(move || {
                        tracing::debug!(%peer, "connection opened");
                        if let Err(error) = serve_connection(&ctx, stream) {
                            tracing::warn!(%peer, %error, "connection failed");
                        }
                        tracing::debug!(%peer, "connection closed");
                    })?;
                connections.push(handle);
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => {
                tracing::warn!(%error, "accept failed");
                thread::sleep(POLL_INTERVAL);
            }
        }
        connections.retain(|handle| !handle.is_finished());
    }

    tracing::info!(open = connections.len(), "closing connections");
    for handle in connections {
        if handle.join().is_err() {
            tracing::error!("connection thread panicked");
        }
    }
    Ok(())
}

/// Answer requests on one connection until EOF, an oversized line, or shutdown.
pub fn serve_connection(ctx: &ServerContext, stream: TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    stream.set_nodelay(true)?;
    let max_line = ctx.config().network.max_line_bytes;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    let mut line = Vec::new();

    loop {
        if ctx.shutdown_requested() {
            return Ok(());
        }
        let budget = (max_line + 1).saturating_sub(line.len()) as u64;
        let eof = match (&mut reader).take(budget).read_until(b'\n', &mut line) {
            Ok(0) if line.is_empty() => return Ok(()),
            Ok(_) => !line.ends_with(b"\n") && line.len() <= max_line,
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                if line.len() > max_line {
                    reply(&mut writer, &Response::error(MSG_TOO_LARGE, ctx.clock().now_unix_ms()))?;
                    return Ok(());
                }
                continue;
            }
            Err(error) => return Err(error),
        };

        if line.len() > max_line {
            reply(&mut writer, &Response::error(MSG_TOO_LARGE, ctx.clock().now_unix_ms()))?;
            return Ok(());
        }
        let response = match std::str::from_utf8(&line) {
            Ok(text) if text.trim().is_empty() => None,
            Ok(text) => Some(handle_line(ctx, text.trim())),
            Err(_) => Some(Response::error(MSG_NOT_UTF8, ctx.clock().now_unix_ms())),
        };
        line.clear();
        if let Some(response) = response {
            reply(&mut writer, &response)?;
        }
        if eof {
            return Ok(());
        }
    }
}

fn reply(writer: &mut BufWriter<TcpStream>, response: &Response) -> io::Result<()> {
    writer.write_all(encode(response).as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()
}
