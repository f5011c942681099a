use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::trace;

use crate::endpoint::DatagramSocket;

struct Mailbox {
    inbox: Mutex<VecDeque<(SocketAddr, Vec<u8>)>>,
    notify: Notify,
}

/// An in-memory datagram network for deterministic protocol tests: sockets
///  deliver to each other instantly, datagrams to unknown addresses vanish
///  like on a real network.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    mailboxes: Arc<Mutex<FxHashMap<SocketAddr, Arc<Mailbox>>>>,
}

impl InMemoryNetwork {
    pub fn new() -> InMemoryNetwork {
        InMemoryNetwork::default()
    }

    pub fn socket(&self, addr: SocketAddr) -> Arc<InMemorySocket> {
        let mailbox = Arc::new(Mailbox {
            inbox: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        let prev = self
            .mailboxes
            .lock()
            .unwrap()
            .insert(addr, mailbox.clone());
        assert!(prev.is_none(), "two sockets bound at {}", addr);
        Arc::new(InMemorySocket {
            addr,
            mailbox,
            network: self.clone(),
        })
    }
}

pub struct InMemorySocket {
    addr: SocketAddr,
    mailbox: Arc<Mailbox>,
    network: InMemoryNetwork,
}

#[async_trait]
impl DatagramSocket for InMemorySocket {
    fn try_send_to(&self, to: SocketAddr, datagram: &[u8]) -> io::Result<()> {
        let target = self.network.mailboxes.lock().unwrap().get(&to).cloned();
        match target {
            Some(mailbox) => {
                mailbox
                    .inbox
                    .lock()
                    .unwrap()
                    .push_back((self.addr, datagram.to_vec()));
                mailbox.notify.notify_one();
            }
            None => trace!("in-memory network: dropping datagram to unbound {}", to),
        }
        Ok(())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.mailbox.inbox.lock().unwrap().pop_front() {
            Some((from, datagram)) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(Some((n, from)))
            }
            None => Ok(None),
        }
    }

    async fn readable(&self) {
        loop {
            {
                if !self.mailbox.inbox.lock().unwrap().is_empty() {
                    return;
                }
            }
            // a permit stored by notify_one before this point is consumed
            // immediately, so no wakeup is lost
            self.mailbox.notify.notified().await;
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl InMemorySocket {
    pub fn num_pending(&self) -> usize {
        self.mailbox.inbox.lock().unwrap().len()
    }
}
