//! Packets through a full session: application end → engine → application end.

use std::io::ErrorKind;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use ovpn_bridge::engine::{LoopbackBuilder, LoopbackOptions, TunnelObserver};
use ovpn_bridge::{Error, Session, SessionConfig};
use parking_lot::Mutex;

const PROFILE: &str = "client\ndev tun\nremote 127.0.0.1 1194 udp\n";

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl TunnelObserver for Recorder {
    fn on_ip_assigned(&self, tunnel_id: &str, address: IpAddr, prefix_len: u8) {
        self.calls
            .lock()
            .push(format!("ip {tunnel_id} {address}/{prefix_len}"));
    }

    fn on_dns_configured(&self, tunnel_id: &str, servers: &[IpAddr]) {
        for s in servers {
            self.calls.lock().push(format!("dns {tunnel_id} {s}"));
        }
    }

    fn on_route_pushed(&self, tunnel_id: &str, address: IpAddr, prefix_len: u8, _ipv6: bool) {
        self.calls
            .lock()
            .push(format!("route {tunnel_id} {address}/{prefix_len}"));
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn three_bytes_out_six_bytes_in() {
    let builder = LoopbackBuilder::new(LoopbackOptions {
        echo: false,
        ..LoopbackOptions::default()
    });
    let stats = builder.stats();
    let recorder = Arc::new(Recorder::default());
    let observer: Weak<dyn TunnelObserver> =
        Arc::downgrade(&(recorder.clone() as Arc<dyn TunnelObserver>));

    let session =
        Session::create("e2e", &builder, Some(observer), None, SessionConfig::default()).unwrap();
    assert!(matches!(session.app_descriptor(), Err(Error::NotReady)));

    session.connect(PROFILE, "user", "pass").unwrap();
    assert!(wait_for(|| session.is_connected()), "{}", session.last_error());
    assert!(session.app_descriptor().unwrap() >= 0);

    let adapter = session.adapter().unwrap();
    let app = adapter.app_end().unwrap();

    // Outbound: the engine sees exactly the 3 bytes written.
    assert_eq!(app.send(&[0x45, 0x00, 0x01]).unwrap(), 3);
    assert!(wait_for(|| stats.packets() == 1));
    assert_eq!(stats.bytes(), 3);

    // Inbound: one read returns exactly the 6 bytes injected.
    assert!(adapter.send_to_application(&[1, 2, 3, 4, 5, 6]));
    let mut buf = [0u8; 1500];
    assert_eq!(app.recv(&mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], &[1, 2, 3, 4, 5, 6]);

    let calls = recorder.calls.lock().clone();
    assert_eq!(
        calls,
        vec![
            "ip e2e 10.8.0.2/24",
            "dns e2e 10.8.0.1",
            "route e2e 10.8.0.0/24",
        ]
    );
    let snapshot = session.snapshot();
    assert_eq!(snapshot.mtu, 1500);
    assert_eq!(snapshot.dns_servers.len(), 1);

    drop(app);
    drop(adapter);
    session.disconnect();
    assert!(!session.is_connected());
    assert!(wait_for(|| session.app_descriptor().is_err()));
    session.destroy();
}

#[test]
fn tunnels_are_isolated() {
    let builder = LoopbackBuilder::default();
    let a = Session::create("a", &builder, None, None, SessionConfig::default()).unwrap();
    let b = Session::create("b", &builder, None, None, SessionConfig::default()).unwrap();
    a.connect(PROFILE, "u", "p").unwrap();
    b.connect(PROFILE, "u", "p").unwrap();
    assert!(wait_for(|| a.is_connected() && b.is_connected()));

    assert_ne!(a.app_descriptor().unwrap(), b.app_descriptor().unwrap());

    let app_a = a.adapter().unwrap().app_end().unwrap();
    let app_b = b.adapter().unwrap().app_end().unwrap();
    app_b.set_nonblocking(true).unwrap();

    app_a.send(&[0x45, 9, 9, 9]).unwrap();
    let mut buf = [0u8; 64];
    assert_eq!(app_a.recv(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], &[0x45, 9, 9, 9]);

    let err = app_b.recv(&mut buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);

    a.destroy();
    b.destroy();
}
