//! An in-process mock gearmand: accepts one connection at a time on a
//! loopback listener, decodes request frames, and answers them through a
//! test-provided handler. Connection-level behavior (serving vs. going
//! silent and hanging up) is scripted per accepted connection, which is
//! what the disconnect/reconnect tests need.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gearman_client::proto::{decode, Decoded, Packet};

/// What to do with one accepted connection.
pub enum ConnPlan {
    /// Read frames and answer them through the packet handler.
    Serve,
    /// Read nothing, wait, then hang up. Data the client wrote in the
    /// meantime is discarded, so the close turns into a hard reset.
    SilenceThenClose(Duration),
}

/// The handler's verdict for one received frame.
pub enum Reply {
    /// Send these frames back.
    Frames(Vec<Packet>),
    /// Send these frames, then drop the connection.
    FramesThenClose(Vec<Packet>),
    /// Say nothing and keep reading.
    None,
}

type PlanFn = Box<dyn FnMut(usize) -> ConnPlan + Send>;
type HandlerFn = Box<dyn FnMut(usize, &Packet) -> Reply + Send>;

pub struct MockServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    received: Arc<Mutex<Vec<(usize, Packet)>>>,
    raw: Arc<Mutex<Vec<u8>>>,
    thread: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Start a server whose every connection serves frames via `handler`.
    pub fn serve(handler: impl FnMut(usize, &Packet) -> Reply + Send + 'static) -> MockServer {
        MockServer::start(|_| ConnPlan::Serve, handler)
    }

    /// Start a server with per-connection plans.
    pub fn start(
        plan: impl FnMut(usize) -> ConnPlan + Send + 'static,
        handler: impl FnMut(usize, &Packet) -> Reply + Send + 'static,
    ) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("mock server addr");
        let stop = Arc::new(AtomicBool::new(false));
        let received = Arc::new(Mutex::new(Vec::new()));
        let raw = Arc::new(Mutex::new(Vec::new()));

        let thread = thread::spawn({
            let stop = Arc::clone(&stop);
            let received = Arc::clone(&received);
            let raw = Arc::clone(&raw);
            let mut plan: PlanFn = Box::new(plan);
            let mut handler: HandlerFn = Box::new(handler);
            move || {
                let mut conn_no = 0;
                while !stop.load(Ordering::SeqCst) {
                    let (stream, _) = match listener.accept() {
                        Ok(accepted) => accepted,
                        Err(_) => break,
                    };
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    conn_no += 1;
                    match plan(conn_no) {
                        ConnPlan::SilenceThenClose(pause) => {
                            thread::sleep(pause);
                            drop(stream);
                        }
                        ConnPlan::Serve => {
                            serve_conn(stream, conn_no, &stop, &received, &raw, &mut handler);
                        }
                    }
                }
            }
        });

        MockServer { addr, stop, received, raw, thread: Some(thread) }
    }

    /// `tcp://...` address for `Client::add_server`.
    pub fn url(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    /// Every decoded request frame, tagged with the connection (1-based)
    /// it arrived on.
    pub fn received(&self) -> Vec<(usize, Packet)> {
        self.received.lock().unwrap().clone()
    }

    /// The raw request bytes as they appeared on the wire.
    pub fn raw_bytes(&self) -> Vec<u8> {
        self.raw.lock().unwrap().clone()
    }
}

fn serve_conn(
    mut stream: TcpStream,
    conn_no: usize,
    stop: &AtomicBool,
    received: &Mutex<Vec<(usize, Packet)>>,
    raw: &Mutex<Vec<u8>>,
    handler: &mut HandlerFn,
) {
    stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .expect("set mock read timeout");
    let mut buf: Vec<u8> = Vec::new();
    loop {
        // Answer every complete frame in the buffer.
        loop {
            match decode(&buf) {
                Ok(Decoded::Frame { packet, consumed }) => {
                    buf.drain(..consumed);
                    received.lock().unwrap().push((conn_no, packet.clone()));
                    match handler(conn_no, &packet) {
                        Reply::None => {}
                        Reply::Frames(frames) => {
                            if write_frames(&mut stream, frames).is_err() {
                                return;
                            }
                        }
                        Reply::FramesThenClose(frames) => {
                            let _ = write_frames(&mut stream, frames);
                            return;
                        }
                    }
                }
                Ok(Decoded::NeedMore(_)) => break,
                Err(_) => return,
            }
        }

        if stop.load(Ordering::SeqCst) {
            return;
        }
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => {
                raw.lock().unwrap().extend_from_slice(&chunk[..n]);
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => return,
        }
    }
}

fn write_frames(stream: &mut TcpStream, frames: Vec<Packet>) -> std::io::Result<()> {
    for frame in frames {
        stream.write_all(&frame.encode().expect("encode mock response"))?;
    }
    Ok(())
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Unblock the accept loop.
        let _ = TcpStream::connect(self.addr);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
