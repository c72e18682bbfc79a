//! Socket integration tests: rendezvous, data transfer, shutdown.

use kernel::{boot, Error, Fid, ShutdownMode, Sys, NOPORT};

fn init_connect_unbound(sys: &Sys, _args: &[u8]) -> i32 {
    let c = sys.socket(NOPORT).unwrap();
    assert_eq!(sys.connect(c, 7, None), Err(Error::PortUnbound));
    assert_eq!(sys.connect(c, 2000, None), Err(Error::BadPort));
    sys.close(c).unwrap();
    0
}

#[test]
fn connecting_to_an_unbound_port_fails() {
    assert_eq!(boot(init_connect_unbound, &[]), 0);
}

fn init_listen_rules(sys: &Sys, _args: &[u8]) -> i32 {
    let unported = sys.socket(NOPORT).unwrap();
    assert_eq!(sys.listen(unported), Err(Error::BadPort));

    let s = sys.socket(9).unwrap();
    sys.listen(s).unwrap();
    assert_eq!(sys.listen(s), Err(Error::AlreadyBound));

    // The port is taken while the listener lives...
    let rival = sys.socket(9).unwrap();
    assert_eq!(sys.listen(rival), Err(Error::PortBound));

    // ...and free again once it is closed.
    sys.close(s).unwrap();
    sys.listen(rival).unwrap();

    sys.close(rival).unwrap();
    sys.close(unported).unwrap();
    0
}

#[test]
fn listen_validates_ports_and_rebinding() {
    assert_eq!(boot(init_listen_rules, &[]), 0);
}

fn init_accept_rules(sys: &Sys, _args: &[u8]) -> i32 {
    let plain = sys.socket(11).unwrap();
    assert_eq!(sys.accept(plain), Err(Error::NotListener));
    let mut buf = [0u8; 4];
    assert_eq!(sys.read(plain, &mut buf), Err(Error::NotConnected));
    assert_eq!(sys.write(plain, b"data"), Err(Error::NotConnected));
    sys.close(plain).unwrap();
    0
}

#[test]
fn only_listeners_accept_and_only_peers_transfer() {
    assert_eq!(boot(init_accept_rules, &[]), 0);
}

// ---------------------------------------------------------------------------
// Rendezvous with data flowing both ways
// ---------------------------------------------------------------------------

fn connector(sys: &Sys, args: &[u8]) -> i32 {
    let gate = Fid(args[0] as usize);
    let c = sys.socket(NOPORT).unwrap();
    if sys.connect(c, 5, None).is_err() {
        return 80;
    }
    // Connecting only queues us; wait for the gate byte the accept side
    // sends once the connection is wired.
    let mut byte = [0u8; 1];
    if sys.read(gate, &mut byte) != Ok(1) {
        return 85;
    }
    if sys.write(c, b"ping").is_err() {
        return 81;
    }
    let mut reply = [0u8; 4];
    let mut got = 0;
    while got < 4 {
        match sys.read(c, &mut reply[got..]) {
            Ok(0) | Err(_) => return 82,
            Ok(n) => got += n,
        }
    }
    if &reply != b"pong" {
        return 83;
    }
    sys.close(c).unwrap();
    0
}

fn init_rendezvous(sys: &Sys, _args: &[u8]) -> i32 {
    let listener = sys.socket(5).unwrap();
    sys.listen(listener).unwrap();
    let (gate_r, gate_w) = sys.pipe().unwrap();

    let worker = sys.create_thread(connector, &[gate_r.0 as u8]).unwrap();
    let peer = sys.accept(listener).unwrap();
    assert_eq!(sys.write(gate_w, b"x").unwrap(), 1);

    let mut request = [0u8; 4];
    let mut got = 0;
    while got < 4 {
        match sys.read(peer, &mut request[got..]) {
            Ok(0) | Err(_) => return 70,
            Ok(n) => got += n,
        }
    }
    assert_eq!(&request, b"ping");
    assert_eq!(sys.write(peer, b"pong").unwrap(), 4);

    assert_eq!(sys.thread_join(worker).unwrap(), 0);
    sys.close(gate_r).unwrap();
    sys.close(gate_w).unwrap();
    sys.close(peer).unwrap();
    sys.close(listener).unwrap();
    0
}

#[test]
fn accept_pairs_a_connector_and_bytes_flow() {
    assert_eq!(boot(init_rendezvous, &[]), 0);
}

// ---------------------------------------------------------------------------
// Write shutdown surfaces as EOF at the peer
// ---------------------------------------------------------------------------

fn half_close_connector(sys: &Sys, args: &[u8]) -> i32 {
    let gate = Fid(args[0] as usize);
    let c = sys.socket(NOPORT).unwrap();
    if sys.connect(c, 6, None).is_err() {
        return 80;
    }
    let mut gate_byte = [0u8; 1];
    if sys.read(gate, &mut gate_byte) != Ok(1) {
        return 85;
    }
    if sys.write(c, b"last words").is_err() {
        return 81;
    }
    if sys.shut_down(c, ShutdownMode::WRITE).is_err() {
        return 82;
    }
    // Our own sends are refused from here on.
    if sys.write(c, b"more") != Err(Error::NotSupported) {
        return 83;
    }
    // The other direction still works: wait for the goodbye.
    let mut byte = [0u8; 1];
    match sys.read(c, &mut byte) {
        Ok(1) if byte[0] == b'!' => {}
        _ => return 84,
    }
    sys.close(c).unwrap();
    0
}

fn init_half_close(sys: &Sys, _args: &[u8]) -> i32 {
    let listener = sys.socket(6).unwrap();
    sys.listen(listener).unwrap();
    let (gate_r, gate_w) = sys.pipe().unwrap();
    let worker = sys
        .create_thread(half_close_connector, &[gate_r.0 as u8])
        .unwrap();
    let peer = sys.accept(listener).unwrap();
    assert_eq!(sys.write(gate_w, b"x").unwrap(), 1);

    let mut buf = [0u8; 32];
    let mut got = 0;
    loop {
        match sys.read(peer, &mut buf[got..]).unwrap() {
            0 => break,
            n => got += n,
        }
    }
    assert_eq!(&buf[..got], b"last words");

    assert_eq!(sys.write(peer, b"!").unwrap(), 1);
    assert_eq!(sys.thread_join(worker).unwrap(), 0);
    sys.close(peer).unwrap();
    sys.close(listener).unwrap();
    0
}

#[test]
fn shutdown_write_drains_then_reports_eof() {
    assert_eq!(boot(init_half_close, &[]), 0);
}

// ---------------------------------------------------------------------------
// The companion is created once and reused by later accepts
// ---------------------------------------------------------------------------

fn quiet_connector(sys: &Sys, _args: &[u8]) -> i32 {
    let c = sys.socket(NOPORT).unwrap();
    if sys.connect(c, 8, None).is_err() {
        return 80;
    }
    // Hold the socket open until the process exits.
    0
}

fn init_companion_reuse(sys: &Sys, _args: &[u8]) -> i32 {
    let listener = sys.socket(8).unwrap();
    sys.listen(listener).unwrap();

    let w1 = sys.create_thread(quiet_connector, &[]).unwrap();
    let first = sys.accept(listener).unwrap();
    assert_eq!(sys.thread_join(w1).unwrap(), 0);

    let w2 = sys.create_thread(quiet_connector, &[]).unwrap();
    let second = sys.accept(listener).unwrap();
    assert_eq!(sys.thread_join(w2).unwrap(), 0);

    // One companion descriptor serves every accepted connection.
    assert_eq!(first, second);

    sys.close(first).unwrap();
    sys.close(listener).unwrap();
    0
}

#[test]
fn every_accept_returns_the_same_companion() {
    assert_eq!(boot(init_companion_reuse, &[]), 0);
}
