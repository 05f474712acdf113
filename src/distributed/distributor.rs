//! Master side of a distributed job.
//!
//! Holds one connection per worker. Fan-out and fan-in run one scoped thread per
//! connection and join them all before returning; a failed link is logged and
//! its contribution counts as absent.

use std::net::TcpStream;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{error, info, warn};

use crate::config::Config;
use crate::distributed::exchange::Exchange;
use crate::distributed::protocol::{Connection, Message, Registration, RunReport, WorkRequest, parse_address};
use crate::error::{Error, Result};

struct Link {
    rank: usize,
    address: String,
    conn: Mutex<Connection>,
    // Completion report that arrived while another message was expected
    early_report: Mutex<Option<RunReport>>,
}

impl Link {
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Distributor {
    links: Vec<Link>,
}

impl Distributor {
    /// Connect to every configured worker, in order, and register them.
    ///
    /// Workers that cannot be reached are logged and left out; ranks are
    /// assigned over the connected ones.
    pub fn connect(config: &Config) -> Result<Self> {
        let mut connected = Vec::new();
        for address in &config.workers {
            let (host, port) = parse_address(address)?;
            match TcpStream::connect((host.as_str(), port)).map_err(Error::from).and_then(Connection::new) {
                Ok(conn) => connected.push((address.clone(), conn)),
                Err(e) => error!("could not connect to worker {}: {}", address, e),
            }
        }

        let num_workers = connected.len() + 1;
        let mut links = Vec::with_capacity(connected.len());
        for (i, (address, mut conn)) in connected.into_iter().enumerate() {
            let rank = i + 1;
            let registration = Registration {
                rank,
                num_workers,
                config: config.clone(),
            };
            conn.send(&Message::Register(registration))?;
            info!("registered worker {} as rank {} of {}", address, rank, num_workers);
            links.push(Link {
                rank,
                address,
                conn: Mutex::new(conn),
                early_report: Mutex::new(None),
            });
        }

        Ok(Self { links })
    }

    /// Master plus connected workers
    pub fn num_workers(&self) -> usize {
        self.links.len() + 1
    }

    pub fn worker_addresses(&self) -> Vec<&str> {
        self.links.iter().map(|l| l.address.as_str()).collect()
    }

    fn link(&self, rank: usize) -> Result<&Link> {
        rank.checked_sub(1)
            .and_then(|i| self.links.get(i))
            .ok_or_else(|| Error::Protocol(format!("no worker with rank {}", rank)))
    }

    pub fn send_to(&self, rank: usize, message: &Message) -> Result<()> {
        self.link(rank)?.lock().send(message)
    }

    pub fn recv_from(&self, rank: usize) -> Result<Option<Message>> {
        self.link(rank)?.lock().recv()
    }

    /// Hand the same work request to every worker
    pub fn assign_work(&self, request: &WorkRequest) -> Result<()> {
        let message = Message::Request(request.clone());
        let sent = self.send_all(&message)?;
        let failed = sent.iter().filter(|ok| !**ok).count();
        if failed > 0 {
            warn!("{} of {} workers did not get the request", failed, self.links.len());
        }
        Ok(())
    }

    /// Send `message` to every worker; one flag per worker tells whether it went out
    pub fn send_all(&self, message: &Message) -> Result<Vec<bool>> {
        self.fan_out(|_| Some(message))
    }

    /// Send `messages[i]` to rank `i + 1`
    pub fn send_each(&self, messages: &[Message]) -> Result<Vec<bool>> {
        if messages.len() != self.links.len() {
            return Err(Error::Protocol(format!(
                "{} messages for {} workers",
                messages.len(),
                self.links.len()
            )));
        }
        self.fan_out(|i| messages.get(i))
    }

    fn fan_out<'m, F>(&self, pick: F) -> Result<Vec<bool>>
    where
        F: Fn(usize) -> Option<&'m Message> + Sync,
    {
        crossbeam::scope(|s| {
            let handles: Vec<_> = self
                .links
                .iter()
                .enumerate()
                .map(|(i, link)| {
                    let pick = &pick;
                    s.spawn(move |_| {
                        let Some(message) = pick(i) else {
                            return false;
                        };
                        match link.lock().send(message) {
                            Ok(()) => true,
                            Err(e) => {
                                error!("sending {} to rank {} failed: {}", message.name(), link.rank, e);
                                false
                            }
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap_or(false)).collect()
        })
        .map_err(|_| Error::Protocol("a sender thread panicked".into()))
    }

    /// Receive one message from every worker, indexed by rank - 1
    pub fn recv_all(&self) -> Result<Vec<Option<Message>>> {
        crossbeam::scope(|s| {
            let handles: Vec<_> = self
                .links
                .iter()
                .map(|link| {
                    s.spawn(move |_| match link.lock().recv() {
                        Ok(Some(message)) => Some(message),
                        Ok(None) => {
                            error!("rank {} closed its connection", link.rank);
                            None
                        }
                        Err(e) => {
                            error!("receiving from rank {} failed: {}", link.rank, e);
                            None
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap_or(None)).collect()
        })
        .map_err(|_| Error::Protocol("a receiver thread panicked".into()))
    }

    /// Wait for every worker to report the end of the current request
    pub fn collect_reports(&self) -> Result<Vec<Option<RunReport>>> {
        let mut reports: Vec<Option<RunReport>> = self
            .links
            .iter()
            .map(|l| l.early_report.lock().unwrap_or_else(PoisonError::into_inner).take())
            .collect();
        let pending: Vec<usize> = (0..self.links.len()).filter(|i| reports[*i].is_none()).collect();
        if pending.is_empty() {
            return Ok(reports);
        }

        let received = crossbeam::scope(|s| {
            let handles: Vec<_> = pending
                .iter()
                .map(|&i| {
                    let link = &self.links[i];
                    s.spawn(move |_| loop {
                        match link.lock().recv() {
                            Ok(Some(Message::Finished(report))) => return Some(report),
                            Ok(Some(other)) => {
                                warn!("ignoring {} message from rank {}", other.name(), link.rank)
                            }
                            Ok(None) => return None,
                            Err(e) => {
                                error!("receiving from rank {} failed: {}", link.rank, e);
                                return None;
                            }
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap_or(None)).collect::<Vec<_>>()
        })
        .map_err(|_| Error::Protocol("a receiver thread panicked".into()))?;

        for (i, report) in pending.into_iter().zip(received) {
            reports[i] = report;
        }
        Ok(reports)
    }

    /// Close every connection; workers see end of stream
    pub fn disconnect(&self) {
        for link in &self.links {
            if let Err(e) = link.lock().shutdown() {
                warn!("closing connection to rank {} failed: {}", link.rank, e);
            }
        }
    }
}

impl Exchange for Distributor {
    fn rank(&self) -> usize {
        0
    }

    fn num_workers(&self) -> usize {
        Distributor::num_workers(self)
    }

    fn gather(&self, payload: Vec<u8>) -> Result<Option<Vec<Option<Vec<u8>>>>> {
        let mut all = Vec::with_capacity(self.num_workers());
        all.push(Some(payload));
        for (link, message) in self.links.iter().zip(self.recv_all()?) {
            match message {
                Some(Message::Exchange(bytes)) => all.push(Some(bytes)),
                Some(Message::Finished(report)) => {
                    warn!("rank {} finished without sending its partitions", link.rank);
                    *link.early_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
                    all.push(None);
                }
                Some(other) => {
                    warn!("expected partitions from rank {}, got {}", link.rank, other.name());
                    all.push(None);
                }
                None => all.push(None),
            }
        }
        Ok(Some(all))
    }

    fn scatter(&self, payloads: Option<Vec<Vec<u8>>>) -> Result<Vec<u8>> {
        let payloads = payloads.ok_or_else(|| Error::Protocol("rank 0 scattered nothing".into()))?;
        if payloads.len() != self.num_workers() {
            return Err(Error::Protocol(format!(
                "{} payloads for {} ranks",
                payloads.len(),
                self.num_workers()
            )));
        }
        let mut payloads = payloads.into_iter();
        let own = payloads.next().unwrap_or_default();
        let messages: Vec<Message> = payloads.map(Message::Exchange).collect();
        self.send_each(&messages)?;
        Ok(own)
    }
}

impl Drop for Distributor {
    fn drop(&mut self) {
        self.disconnect();
    }
}
