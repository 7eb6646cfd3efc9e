// SHOAL — DEMO BINARY
// Brings the stack up on per-core loopback ports and runs a UDP echo
// service on port 7. With --count N, core 0 also plays client: it sends N
// datagrams at the host address and the run ends once every echo came back,
// wherever flow steering delivered it. Without it, the workers poll until
// SIGINT/SIGTERM.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shoal_stack::driver::mbuf::MbufPool;
use shoal_stack::driver::port::{configure_port, LoopbackPort, NicPort};
use shoal_stack::driver::queue::NicQueue;
use shoal_stack::driver::MBUFS_PER_QUEUE;
use shoal_stack::engine::clock::system_clock;
use shoal_stack::engine::smp::{self, CoreTask, Smp};
use shoal_stack::engine::{fatal, E_WORKER_SPAWN};
use shoal_stack::net::arp::NeighborCache;
use shoal_stack::net::icmp::Icmp;
use shoal_stack::net::ipv4::{InetConfig, Ipv4, L2Sink};
use shoal_stack::net::udp::Udp;
use shoal_stack::net::wire::{IP_PROTO_ICMP, IP_PROTO_UDP};
use shoal_stack::net::{CpuId, EthernetAddress, Ipv4Address};
use shoal_stack::packet::Packet;

const ECHO_PORT: u16 = 7;
const CLIENT_PORT: u16 = 10007;

/// Process-wide shutdown flag. Set by the SIGTERM/SIGINT handler, checked at
/// the top of every worker loop iteration.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn parse_addr(s: &str) -> Option<Ipv4Address> {
    let mut o = [0u8; 4];
    let mut it = s.split('.');
    for b in o.iter_mut() {
        *b = it.next()?.parse().ok()?;
    }
    if it.next().is_some() {
        return None;
    }
    Some(Ipv4Address::new(o[0], o[1], o[2], o[3]))
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as *const () as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as *const () as libc::sighandler_t);
    }

    let mut cores: u32 = 2;
    let mut count: u64 = 8;
    let mut host = Ipv4Address::new(10, 0, 0, 1);
    let mut netmask = Ipv4Address::new(255, 255, 255, 0);
    let mut gateway = Ipv4Address::new(10, 0, 0, 254);

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--cores" => {
                i += 1;
                cores = args.get(i).and_then(|v| v.parse().ok()).unwrap_or(cores).max(1);
            }
            "--count" => {
                i += 1;
                count = args.get(i).and_then(|v| v.parse().ok()).unwrap_or(count);
            }
            "--addr" => {
                i += 1;
                host = args.get(i).and_then(|v| parse_addr(v)).unwrap_or(host);
            }
            "--mask" => {
                i += 1;
                netmask = args.get(i).and_then(|v| parse_addr(v)).unwrap_or(netmask);
            }
            "--gw" => {
                i += 1;
                gateway = args.get(i).and_then(|v| parse_addr(v)).unwrap_or(gateway);
            }
            other => {
                tracing::warn!(arg = other, "unknown argument ignored");
            }
        }
        i += 1;
    }

    let cfg = InetConfig { host, netmask, gateway };
    let smp = Smp::new(cores);
    let replies = Arc::new(AtomicU64::new(0));
    tracing::info!(cores, host = %host, "shoal starting");

    let mut handles = Vec::with_capacity(cores as usize);
    for idx in 0..cores {
        let smp = smp.clone();
        let replies = replies.clone();
        let handle = std::thread::Builder::new()
            .name(format!("shoal-w{idx}"))
            .spawn(move || worker_entry(idx, smp, cfg, count, replies))
            .unwrap_or_else(|_| fatal(E_WORKER_SPAWN, "thread spawn failed"));
        handles.push(handle);
    }

    for h in handles {
        let _ = h.join();
    }
    tracing::info!(replies = replies.load(Ordering::Relaxed), "all workers stopped, clean exit");
}

fn mac_for(idx: CpuId) -> EthernetAddress {
    EthernetAddress([0x02, 0x53, 0x48, 0x4C, 0x00, idx as u8])
}

fn worker_entry(idx: CpuId, smp: Arc<Smp>, cfg: InetConfig, count: u64, replies: Arc<AtomicU64>) {
    smp::pin_current(idx);
    smp::pin_to_core(idx as usize);

    // Each core owns its slice of the device: one queue, one pool, one
    // engine. The loopback wire answers on the same queue it was fed.
    let mac = mac_for(idx);
    let mut port = LoopbackPort::new(mac, 1, 0, 0);
    let (_, conf, hw) = configure_port(&mut port, 1);
    let port: Rc<RefCell<dyn NicPort>> = Rc::new(RefCell::new(port));
    let pool = MbufPool::create(2 * MBUFS_PER_QUEUE);
    let queue = Rc::new(RefCell::new(NicQueue::new(port, 0, pool, hw, conf.hw_vlan_strip)));

    let q = queue.clone();
    let l2: L2Sink = Rc::new(move |p| q.borrow_mut().send(p));
    let arp = Rc::new(RefCell::new(NeighborCache::new()));
    arp.borrow_mut().insert(cfg.host, mac);
    let mut ip = Ipv4::new(cfg, hw, mac, idx, smp.clone(), arp, system_clock(), l2);

    ip.register_l4(IP_PROTO_ICMP, Rc::new(Icmp::new(smp.count())));
    let udp = Rc::new(Udp::new(smp.count()));
    ip.register_l4(IP_PROTO_UDP, udp.clone());

    // Echo service: answer on the requester's port, whatever core the flow
    // steered us to.
    udp.bind(
        ECHO_PORT,
        Box::new(|ip, d| {
            Udp::send(ip, ECHO_PORT, d.src, d.src_port, d.payload);
        }),
    );
    // Echo sink: every core may end up owning the reply flow.
    let r = replies.clone();
    udp.bind(
        CLIENT_PORT,
        Box::new(move |_ip, d| {
            r.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(len = d.payload.len(), src = %d.src, "echo reply");
        }),
    );

    if idx == 0 && count > 0 {
        for n in 0..count {
            let payload = format!("shoal self-test datagram {n}");
            Udp::send(&mut ip, CLIENT_PORT, cfg.host, ECHO_PORT, Packet::from_slice(payload.as_bytes()));
        }
        tracing::info!(count, "self-test datagrams sent");
    }

    loop {
        if SHUTDOWN.load(Ordering::Relaxed) {
            break;
        }
        let mut work = 0usize;
        for task in smp.drain(idx) {
            work += 1;
            match task {
                CoreTask::Run(f) => f(),
                CoreTask::Rx(p) => ip.receive_ethernet(p),
            }
        }
        let pkts = queue.borrow_mut().poll_rx_once();
        work += pkts.len();
        for p in pkts {
            ip.receive_ethernet(p);
        }
        ip.poll_timers();

        if count > 0 && replies.load(Ordering::Relaxed) >= count {
            SHUTDOWN.store(true, Ordering::Relaxed);
            break;
        }
        if work == 0 {
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    let qs = queue.borrow().stats;
    tracing::info!(
        core = idx,
        rx = qs.rx_packets,
        tx = qs.tx_packets,
        delivered = ip.stats.rx_delivered,
        forwarded = ip.stats.rx_forwarded,
        "worker stopped"
    );
}
