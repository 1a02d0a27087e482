//! Virtualised UDP sockets for plugins holding the `rawSockets` capability.
//!
//! Guests see small integer ids. Every operation names the calling plugin and
//! is refused unless that plugin created the socket. Inbound datagrams are
//! read by a host task into a bounded FIFO the guest polls; when the FIFO is
//! full the oldest datagram is dropped. Sends are handed to a host task and
//! report the requested length straight away.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::PluginError;

pub type SocketId = i32;

/// Largest UDP payload.
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFamily {
    V4,
    V6,
}

impl SocketFamily {
    /// Decode the guest's family argument (0 = udp4, 1 = udp6).
    pub fn from_abi(value: i32) -> Option<Self> {
        match value {
            0 => Some(SocketFamily::V4),
            1 => Some(SocketFamily::V6),
            _ => None,
        }
    }

    fn unspecified(self) -> IpAddr {
        match self {
            SocketFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    fn matches(self, addr: &IpAddr) -> bool {
        matches!(
            (self, addr),
            (SocketFamily::V4, IpAddr::V4(_)) | (SocketFamily::V6, IpAddr::V6(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

/// Options requested before bind are remembered and applied at bind time.
#[derive(Debug, Clone, Default)]
struct SocketOptions {
    broadcast: Option<bool>,
    multicast_ttl: Option<u32>,
    multicast_loopback: Option<bool>,
}

/// Interface a multicast membership is tied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MulticastInterface {
    V4(Ipv4Addr),
    /// IPv6 interface index; 0 lets the OS pick.
    Index(u32),
}

type Membership = (IpAddr, MulticastInterface);

struct Bound {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

struct SocketEntry {
    owner: String,
    family: SocketFamily,
    options: SocketOptions,
    memberships: HashSet<Membership>,
    bound: Option<Bound>,
    queue: Arc<Mutex<VecDeque<Datagram>>>,
}

impl Drop for SocketEntry {
    fn drop(&mut self) {
        if let Some(bound) = &self.bound {
            bound.reader.abort();
        }
    }
}

pub struct SocketManager {
    entries: Mutex<HashMap<SocketId, SocketEntry>>,
    next_id: AtomicI32,
    queue_limit: usize,
    runtime: Handle,
}

fn parse_ip(value: &str) -> Result<IpAddr, PluginError> {
    value
        .trim()
        .parse()
        .map_err(|_| PluginError::Socket(format!("invalid IP address '{value}'")))
}

fn apply_options(
    socket: &UdpSocket,
    family: SocketFamily,
    options: &SocketOptions,
) -> Result<(), PluginError> {
    if let Some(flag) = options.broadcast {
        socket.set_broadcast(flag)?;
    }
    if let Some(ttl) = options.multicast_ttl {
        if family == SocketFamily::V4 {
            socket.set_multicast_ttl_v4(ttl)?;
        }
    }
    if let Some(flag) = options.multicast_loopback {
        match family {
            SocketFamily::V4 => socket.set_multicast_loop_v4(flag)?,
            SocketFamily::V6 => socket.set_multicast_loop_v6(flag)?,
        }
    }
    Ok(())
}

/// Parse the interface argument for a membership of `group`.
///
/// IPv4 groups take an interface address. IPv6 groups take an interface
/// index, either bare (`3`) or as the zone of an address (`fe80::1%3`).
fn parse_interface(group: &IpAddr, interface: Option<&str>) -> Result<MulticastInterface, PluginError> {
    let interface = interface.map(str::trim).filter(|i| !i.is_empty());
    match group {
        IpAddr::V4(_) => match interface.map(parse_ip).transpose()? {
            None => Ok(MulticastInterface::V4(Ipv4Addr::UNSPECIFIED)),
            Some(IpAddr::V4(addr)) => Ok(MulticastInterface::V4(addr)),
            Some(IpAddr::V6(_)) => Err(PluginError::Socket(
                "IPv4 group requires an IPv4 interface".into(),
            )),
        },
        IpAddr::V6(_) => {
            let Some(interface) = interface else {
                return Ok(MulticastInterface::Index(0));
            };
            let index = interface.rsplit_once('%').map_or(interface, |(_, zone)| zone);
            index.parse().map(MulticastInterface::Index).map_err(|_| {
                PluginError::Socket(format!(
                    "IPv6 interface '{interface}' must be an interface index or carry one as %zone"
                ))
            })
        }
    }
}

fn change_membership(
    socket: &UdpSocket,
    (group, iface): &Membership,
    join: bool,
) -> Result<(), PluginError> {
    match (group, iface) {
        (IpAddr::V4(group), MulticastInterface::V4(iface)) => {
            if join {
                socket.join_multicast_v4(*group, *iface)?;
            } else {
                socket.leave_multicast_v4(*group, *iface)?;
            }
        }
        (IpAddr::V6(group), MulticastInterface::Index(index)) => {
            if join {
                socket.join_multicast_v6(group, *index)?;
            } else {
                socket.leave_multicast_v6(group, *index)?;
            }
        }
        _ => {
            return Err(PluginError::Socket(format!(
                "interface {iface:?} does not match group {group}"
            )))
        }
    }
    Ok(())
}

async fn read_datagrams(
    id: SocketId,
    socket: Arc<UdpSocket>,
    queue: Arc<Mutex<VecDeque<Datagram>>>,
    limit: usize,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                let mut queue = queue.lock();
                if queue.len() >= limit {
                    queue.pop_front();
                    tracing::debug!(socket = id, "inbound queue full, dropped oldest datagram");
                }
                queue.push_back(Datagram {
                    data: buf[..len].to_vec(),
                    from,
                });
            }
            Err(e) => {
                tracing::debug!(socket = id, "receive error: {e}");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

impl SocketManager {
    pub fn new(queue_limit: usize, runtime: Handle) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(1),
            queue_limit: queue_limit.max(1),
            runtime,
        }
    }

    /// Run `f` on a socket the plugin owns.
    fn with_owned<R>(
        &self,
        plugin_id: &str,
        id: SocketId,
        f: impl FnOnce(&mut SocketEntry) -> Result<R, PluginError>,
    ) -> Result<R, PluginError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| PluginError::Socket(format!("unknown socket {id}")))?;
        if entry.owner != plugin_id {
            return Err(PluginError::Socket(format!(
                "socket {id} is not owned by {plugin_id}"
            )));
        }
        f(entry)
    }

    pub fn create(&self, plugin_id: &str, family: SocketFamily) -> SocketId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(
            id,
            SocketEntry {
                owner: plugin_id.to_string(),
                family,
                options: SocketOptions::default(),
                memberships: HashSet::new(),
                bound: None,
                queue: Arc::new(Mutex::new(VecDeque::new())),
            },
        );
        tracing::debug!(plugin = %plugin_id, socket = id, ?family, "created socket");
        id
    }

    pub fn bind(
        &self,
        plugin_id: &str,
        id: SocketId,
        port: u16,
        address: Option<&str>,
    ) -> Result<SocketAddr, PluginError> {
        self.with_owned(plugin_id, id, |entry| self.bind_entry(id, entry, port, address))
    }

    fn bind_entry(
        &self,
        id: SocketId,
        entry: &mut SocketEntry,
        port: u16,
        address: Option<&str>,
    ) -> Result<SocketAddr, PluginError> {
        if entry.bound.is_some() {
            return Err(PluginError::Socket(format!("socket {id} is already bound")));
        }
        let ip = match address.filter(|a| !a.trim().is_empty()) {
            Some(address) => parse_ip(address)?,
            None => entry.family.unspecified(),
        };
        if !entry.family.matches(&ip) {
            return Err(PluginError::Socket(format!(
                "address {ip} does not match {:?} socket",
                entry.family
            )));
        }

        let std_socket = std::net::UdpSocket::bind(SocketAddr::new(ip, port))?;
        std_socket.set_nonblocking(true)?;
        let socket = {
            let _runtime = self.runtime.enter();
            UdpSocket::from_std(std_socket)?
        };
        apply_options(&socket, entry.family, &entry.options)?;
        for membership in &entry.memberships {
            change_membership(&socket, membership, true)?;
        }

        let local = socket.local_addr()?;
        let socket = Arc::new(socket);
        let reader = self.runtime.spawn(read_datagrams(
            id,
            socket.clone(),
            entry.queue.clone(),
            self.queue_limit,
        ));
        entry.bound = Some(Bound { socket, reader });
        tracing::debug!(socket = id, %local, "bound socket");
        Ok(local)
    }

    pub fn join_multicast(
        &self,
        plugin_id: &str,
        id: SocketId,
        group: &str,
        interface: Option<&str>,
    ) -> Result<(), PluginError> {
        self.update_membership(plugin_id, id, group, interface, true)
    }

    pub fn leave_multicast(
        &self,
        plugin_id: &str,
        id: SocketId,
        group: &str,
        interface: Option<&str>,
    ) -> Result<(), PluginError> {
        self.update_membership(plugin_id, id, group, interface, false)
    }

    fn update_membership(
        &self,
        plugin_id: &str,
        id: SocketId,
        group: &str,
        interface: Option<&str>,
        join: bool,
    ) -> Result<(), PluginError> {
        let group = parse_ip(group)?;
        if !group.is_multicast() {
            return Err(PluginError::Socket(format!("{group} is not a multicast group")));
        }
        let membership = (group, parse_interface(&group, interface)?);

        self.with_owned(plugin_id, id, |entry| {
            if !entry.family.matches(&group) {
                return Err(PluginError::Socket(format!(
                    "group {group} does not match {:?} socket",
                    entry.family
                )));
            }
            if let Some(bound) = &entry.bound {
                change_membership(&bound.socket, &membership, join)?;
            }
            if join {
                entry.memberships.insert(membership);
            } else if !entry.memberships.remove(&membership) {
                return Err(PluginError::Socket(format!("socket {id} is not a member of {group}")));
            }
            Ok(())
        })
    }

    pub fn set_multicast_ttl(&self, plugin_id: &str, id: SocketId, ttl: u32) -> Result<(), PluginError> {
        self.with_owned(plugin_id, id, |entry| {
            if entry.family != SocketFamily::V4 {
                return Err(PluginError::Socket("multicast TTL applies to udp4 sockets only".into()));
            }
            entry.options.multicast_ttl = Some(ttl);
            if let Some(bound) = &entry.bound {
                bound.socket.set_multicast_ttl_v4(ttl)?;
            }
            Ok(())
        })
    }

    pub fn set_multicast_loopback(&self, plugin_id: &str, id: SocketId, enabled: bool) -> Result<(), PluginError> {
        self.with_owned(plugin_id, id, |entry| {
            entry.options.multicast_loopback = Some(enabled);
            if let Some(bound) = &entry.bound {
                apply_options(&bound.socket, entry.family, &entry.options)?;
            }
            Ok(())
        })
    }

    pub fn set_broadcast(&self, plugin_id: &str, id: SocketId, enabled: bool) -> Result<(), PluginError> {
        self.with_owned(plugin_id, id, |entry| {
            entry.options.broadcast = Some(enabled);
            if let Some(bound) = &entry.bound {
                bound.socket.set_broadcast(enabled)?;
            }
            Ok(())
        })
    }

    /// Queue `data` for `host:port` and return its length.
    ///
    /// An unbound socket is bound to an ephemeral port first. Delivery
    /// failures are only logged.
    pub fn send(
        &self,
        plugin_id: &str,
        id: SocketId,
        host: &str,
        port: u16,
        data: Vec<u8>,
    ) -> Result<usize, PluginError> {
        let socket = self.with_owned(plugin_id, id, |entry| {
            if entry.bound.is_none() {
                self.bind_entry(id, entry, 0, None)?;
            }
            entry
                .bound
                .as_ref()
                .map(|b| b.socket.clone())
                .ok_or_else(|| PluginError::Socket(format!("socket {id} is not bound")))
        })?;

        let len = data.len();
        let host = host.trim().to_string();
        self.runtime.spawn(async move {
            if let Err(e) = socket.send_to(&data, (host.as_str(), port)).await {
                tracing::debug!(socket = id, target = %host, port, "send failed: {e}");
            }
        });
        Ok(len)
    }

    /// Pop the oldest buffered datagram, if any.
    ///
    /// A zero-length datagram is returned like any other; the guest binding
    /// reports it as length 0, the same as an empty queue, so guests that
    /// care check [`SocketManager::pending`] first.
    pub fn recv(&self, plugin_id: &str, id: SocketId) -> Result<Option<Datagram>, PluginError> {
        self.with_owned(plugin_id, id, |entry| Ok(entry.queue.lock().pop_front()))
    }

    pub fn pending(&self, plugin_id: &str, id: SocketId) -> Result<usize, PluginError> {
        self.with_owned(plugin_id, id, |entry| Ok(entry.queue.lock().len()))
    }

    pub fn local_addr(&self, plugin_id: &str, id: SocketId) -> Result<Option<SocketAddr>, PluginError> {
        self.with_owned(plugin_id, id, |entry| {
            entry
                .bound
                .as_ref()
                .map(|b| b.socket.local_addr())
                .transpose()
                .map_err(PluginError::from)
        })
    }

    pub fn close(&self, plugin_id: &str, id: SocketId) -> Result<(), PluginError> {
        self.with_owned(plugin_id, id, |_| Ok(()))?;
        self.entries.lock().remove(&id);
        tracing::debug!(plugin = %plugin_id, socket = id, "closed socket");
        Ok(())
    }

    /// Close every socket owned by `plugin_id`, returning how many there were.
    pub fn close_all_for(&self, plugin_id: &str) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.owner != plugin_id);
        let closed = before - entries.len();
        if closed > 0 {
            tracing::info!(plugin = %plugin_id, closed, "closed plugin sockets");
        }
        closed
    }

    pub fn count_for(&self, plugin_id: &str) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.owner == plugin_id)
            .count()
    }
}
