//! TCP front end.
//!
//! One thread per connection, one command per connection.  Data replies
//! are prefixed with a NUL byte; anything else the client reads is an
//! error message.  Control replies are plain text.

use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use fa_capture::Ring;
use fa_core::{FaError, Result};
use fa_store::Archive;

use crate::protocol::{parse_command, Command};
use crate::read::ReadEngine;
use crate::subscribe::run_subscription;

/// Longest command line accepted from a client.
const COMMAND_LIMIT: usize = 4096;

/// Latch the daemon main thread blocks on until a `CQ` command arrives.
#[derive(Default)]
pub struct ShutdownFlag {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl ShutdownFlag {
    pub fn new() -> ShutdownFlag {
        ShutdownFlag::default()
    }

    pub fn trigger(&self) {
        *self.triggered.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock()
    }

    /// Blocks until [`trigger`](Self::trigger) is called.
    pub fn wait(&self) {
        let mut triggered = self.triggered.lock();
        while !*triggered {
            self.cond.wait(&mut triggered);
        }
    }
}

/// Shared state behind every client connection.
pub struct Server {
    archive: Arc<Archive>,
    engine: ReadEngine,
    ring: Ring,
    write_enable: Arc<AtomicBool>,
    shutdown: Arc<ShutdownFlag>,
    /// Nominal frame rate, reported while no block duration is known yet.
    sample_frequency: f64,
}

impl Server {
    pub fn new(
        archive: Arc<Archive>,
        engine: ReadEngine,
        ring: Ring,
        write_enable: Arc<AtomicBool>,
        shutdown: Arc<ShutdownFlag>,
        sample_frequency: f64,
    ) -> Server {
        Server {
            archive,
            engine,
            ring,
            write_enable,
            shutdown,
            sample_frequency,
        }
    }

    /// Accept loop.  Returns when the listener fails or shutdown has been
    /// triggered; each connection is served on its own thread.
    pub fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(address = %listener.local_addr()?, "listening");
        for stream in listener.incoming() {
            if self.shutdown.is_triggered() {
                break;
            }
            let stream = match stream {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(%error, "accept failed");
                    continue;
                }
            };
            let server = Arc::clone(&self);
            let builder = thread::Builder::new().name("client".to_string());
            builder.spawn(move || {
                if let Err(error) = server.serve(stream) {
                    // Client went away or sent garbage; only this
                    // connection is affected.
                    info!(%error, "connection closed");
                }
            })?;
        }
        Ok(())
    }

    fn serve(&self, stream: TcpStream) -> Result<()> {
        let peer = stream.peer_addr()?;
        let line = read_command_line(&stream)?;
        debug!(%peer, command = %line, "request");
        let mut out = BufWriter::new(&stream);
        match parse_command(&line) {
            Ok(Command::Subscribe {
                mask,
                want_timestamp,
            }) => run_subscription(&self.ring, &mask, want_timestamp, &mut out)?,
            Ok(Command::Read(request)) => {
                if let Err(error) = self.engine.read(&request, &mut out) {
                    report_error(&mut out, &error)?;
                }
            }
            Ok(Command::Control(commands)) => {
                for command in commands {
                    self.control(command, &mut out)?;
                }
            }
            Err(error) => report_error(&mut out, &error)?,
        }
        out.flush()?;
        Ok(())
    }

    fn control(&self, command: char, out: &mut impl Write) -> Result<()> {
        match command {
            'Q' => {
                writeln!(out, "Shutdown")?;
                out.flush()?;
                info!("shutdown requested");
                self.shutdown.trigger();
            }
            'H' => {
                info!("archiving halted");
                self.write_enable.store(false, Ordering::Relaxed);
            }
            'R' => {
                info!("archiving resumed");
                self.write_enable.store(true, Ordering::Relaxed);
            }
            'S' => writeln!(out, "{}", self.status_line())?,
            'F' => writeln!(out, "{:.6}", self.mean_frame_rate())?,
            'd' => writeln!(out, "{}", self.archive.geometry().first_decimation)?,
            'D' => {
                let geometry = self.archive.geometry();
                writeln!(
                    out,
                    "{}",
                    geometry.first_decimation * geometry.second_decimation
                )?
            }
            _ => unreachable!("validated by the parser"),
        }
        Ok(())
    }

    /// One line of counters: halted flag, current block and block count,
    /// capture backlog, write buffer in flight and smoothed block duration.
    fn status_line(&self) -> String {
        let geometry = self.archive.geometry();
        let guard = self.archive.lock();
        let header = guard.header();
        let halted = !self.write_enable.load(Ordering::Relaxed);
        format!(
            "{} {}/{} {} {} {}",
            u8::from(halted),
            header.current_major_block,
            geometry.major_block_count,
            header.write_backlog,
            header.write_buffer,
            header.last_duration,
        )
    }

    fn mean_frame_rate(&self) -> f64 {
        let geometry = self.archive.geometry();
        let duration = self.archive.lock().header().last_duration;
        if duration == 0 {
            self.sample_frequency
        } else {
            geometry.major_sample_count as f64 * 1e6 / duration as f64
        }
    }
}

/// Reads the newline-terminated command, rejecting oversized lines.
fn read_command_line(stream: &TcpStream) -> Result<String> {
    let mut reader = BufReader::new(stream).take(COMMAND_LIMIT as u64);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if !line.ends_with('\n') {
        return Err(FaError::parse(
            "command",
            "Command too long or truncated",
            &line,
            "",
        ));
    }
    line.truncate(line.trim_end_matches(['\r', '\n']).len());
    Ok(line)
}

/// Failure replies are a plain text line; success replies always start
/// with a NUL byte, so the two cannot be confused.
fn report_error(out: &mut impl Write, error: &FaError) -> std::io::Result<()> {
    writeln!(out, "{error}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_flag_releases_waiter() {
        let flag = Arc::new(ShutdownFlag::new());
        let waiter = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || flag.wait())
        };
        assert!(!flag.is_triggered());
        flag.trigger();
        waiter.join().unwrap();
        assert!(flag.is_triggered());
    }
}
