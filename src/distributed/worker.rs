//! Worker side of a distributed job.
//!
//! A worker listens for masters. Each connection gets its own thread: it reads
//! the registration, then runs every work request it receives with the rank
//! and worker count the master assigned, until the master disconnects.

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, info, warn};

use crate::config::Config;
use crate::distributed::exchange::Exchange;
use crate::distributed::protocol::{Connection, Message, RunReport, WorkRequest};
use crate::error::{Error, Result};
use crate::scheduler::{JobRegistry, Scheduler};

/// Connection to rank 0, shared by the request loop and the partition exchange
pub struct WorkerLink {
    rank: usize,
    num_workers: usize,
    conn: Mutex<Connection>,
}

impl WorkerLink {
    pub fn new(rank: usize, num_workers: usize, conn: Connection) -> Self {
        Self {
            rank,
            num_workers,
            conn: Mutex::new(conn),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn send(&self, message: &Message) -> Result<()> {
        self.lock().send(message)
    }

    pub fn recv(&self) -> Result<Option<Message>> {
        self.lock().recv()
    }
}

impl Exchange for WorkerLink {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_workers(&self) -> usize {
        self.num_workers
    }

    fn gather(&self, payload: Vec<u8>) -> Result<Option<Vec<Option<Vec<u8>>>>> {
        self.send(&Message::Exchange(payload))?;
        Ok(None)
    }

    fn scatter(&self, _payloads: Option<Vec<Vec<u8>>>) -> Result<Vec<u8>> {
        match self.lock().expect()? {
            Message::Exchange(bytes) => Ok(bytes),
            other => Err(Error::Protocol(format!(
                "expected partitions from rank 0, got {}",
                other.name()
            ))),
        }
    }
}

pub struct Worker {
    listener: TcpListener,
    registry: Arc<JobRegistry>,
    local_dir: PathBuf,
}

impl Worker {
    /// Listen on `address`; intermediate files go to `local_dir` whatever the
    /// master configures
    pub fn bind<A: ToSocketAddrs>(address: A, registry: Arc<JobRegistry>, local_dir: &Path) -> Result<Self> {
        let listener = TcpListener::bind(address)?;
        info!("worker listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            registry,
            local_dir: local_dir.to_path_buf(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept masters forever, one thread per connection
    pub fn serve(&self) -> Result<()> {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let registry = Arc::clone(&self.registry);
                    let local_dir = self.local_dir.clone();
                    std::thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, &registry, &local_dir) {
                            error!("connection failed: {}", e);
                        }
                    });
                }
                Err(e) => error!("accept failed: {}", e),
            }
        }
        Ok(())
    }

    /// Accept a single master and serve it on the calling thread
    pub fn serve_one(&self) -> Result<()> {
        let (stream, _) = self.listener.accept()?;
        handle_connection(stream, &self.registry, &self.local_dir)
    }
}

fn handle_connection(stream: TcpStream, registry: &Arc<JobRegistry>, local_dir: &Path) -> Result<()> {
    let mut conn = Connection::new(stream)?;
    let peer = conn.peer();
    let registration = match conn.recv()? {
        Some(Message::Register(registration)) => registration,
        Some(other) => {
            return Err(Error::Protocol(format!(
                "expected registration from {}, got {}",
                peer,
                other.name()
            )));
        }
        None => return Ok(()),
    };

    let rank = registration.rank;
    let num_workers = registration.num_workers;
    let mut config = registration.config;
    config.local_dir = local_dir.to_path_buf();
    config.disks.clear();
    info!("registered by {} as rank {} of {}", peer, rank, num_workers);

    let config = Arc::new(config);
    let link = Arc::new(WorkerLink::new(rank, num_workers, conn));
    let exchange: Arc<dyn Exchange> = link.clone();
    let scheduler = Scheduler::for_worker(Arc::clone(&config), Arc::clone(registry), exchange)?;

    loop {
        match link.recv()? {
            Some(Message::Request(request)) => {
                let outcome = run_request(&scheduler, registry, &config, &request);
                if let Err(e) = &outcome {
                    error!("rank {}: {} failed: {}", rank, request.operation, e);
                }
                let report = RunReport {
                    rank,
                    error: outcome.err().map(|e| e.to_string()),
                };
                link.send(&Message::Finished(report))?;
            }
            Some(other) => warn!("rank {}: ignoring {} message", rank, other.name()),
            None => {
                info!("rank {}: master {} disconnected", rank, peer);
                return Ok(());
            }
        }
    }
}

fn run_request(scheduler: &Scheduler, registry: &JobRegistry, config: &Arc<Config>, request: &WorkRequest) -> Result<()> {
    let mut args = request
        .args
        .iter()
        .map(|wire| registry.decode_arg(wire, config))
        .collect::<Result<Vec<_>>>()?;
    scheduler.execute(&request.operation, &mut args)?;
    Ok(())
}
