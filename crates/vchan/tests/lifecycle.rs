mod common;

use std::{thread, time::Duration};

use common::{socket_dir_init, wait_until};
use vchan::{State, Vchan};

#[test]
fn client_retries_until_the_server_shows_up() {
    socket_dir_init();
    let client = Vchan::client(0, 20).unwrap();
    assert_eq!(client.state(), State::Disconnected);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(client.state(), State::Disconnected);

    let server = Vchan::server(0, 20, 4096, 4096).unwrap();
    wait_until(|| client.state() == State::Connected, "client to connect");
    wait_until(|| server.state() == State::Connected, "server to accept");
}

#[test]
fn remainder_stays_readable_after_the_peer_closes() {
    socket_dir_init();
    let server = Vchan::server(0, 21, 4096, 4096).unwrap();
    let client = Vchan::client(0, 21).unwrap();
    wait_until(|| client.state() == State::Connected, "client to connect");

    server.send(b"HELLO").unwrap();
    wait_until(|| client.data_ready() == 5, "bytes to arrive");
    server.close();

    wait_until(|| client.state() == State::Disconnected, "client to see the close");
    let mut buf = [0u8; 8];
    assert_eq!(client.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"HELLO");
}

#[test]
fn close_flushes_accepted_bytes() {
    socket_dir_init();
    let server = Vchan::server(0, 22, 4096, 4096).unwrap();
    let client = Vchan::client(0, 22).unwrap();
    wait_until(|| client.state() == State::Connected, "client to connect");

    let payload: Vec<u8> = (0..10_000).map(|i| (i % 253) as u8).collect();
    server.send(&payload).unwrap();
    server.close();

    let mut got = vec![0u8; payload.len()];
    let mut read = 0;
    while read < got.len() {
        read += client.read(&mut got[read..]).unwrap();
    }
    assert_eq!(got, payload);
    wait_until(|| client.state() == State::Disconnected, "terminal state");
}

#[test]
fn close_a_server_nobody_connected_to() {
    socket_dir_init();
    let server = Vchan::server(0, 23, 4096, 4096).unwrap();
    thread::sleep(Duration::from_millis(50));
    server.close();
}

#[test]
fn close_a_client_nobody_answers() {
    socket_dir_init();
    let client = Vchan::client(0, 24).unwrap();
    thread::sleep(Duration::from_millis(250));
    client.close();
}

#[test]
fn close_immediately_after_init() {
    socket_dir_init();
    Vchan::server(0, 25, 4096, 4096).unwrap().close();
    Vchan::client(0, 26).unwrap().close();
}

#[test]
fn wait_reports_the_peer_going_away() {
    socket_dir_init();
    let server = Vchan::server(0, 27, 4096, 4096).unwrap();
    let client = Vchan::client(0, 27).unwrap();
    wait_until(|| client.state() == State::Connected, "client to connect");

    server.close();
    // At least the connect transition is still queued on the event fd,
    // so this returns instead of hanging.
    client.wait().unwrap();
    wait_until(|| client.state() == State::Disconnected, "disconnect to surface");
}

#[test]
fn both_sides_drop_after_a_session() {
    socket_dir_init();
    let server = Vchan::server(0, 28, 4096, 4096).unwrap();
    let client = Vchan::client(0, 28).unwrap();
    wait_until(|| server.state() == State::Connected, "session to establish");

    client.send(b"bye").unwrap();
    let mut buf = [0u8; 3];
    server.recv(&mut buf).unwrap();
    drop(client);
    wait_until(|| server.state() == State::Disconnected, "server to notice");
    drop(server);
}

#[test]
fn empty_buffers_return_immediately() {
    socket_dir_init();
    let server = Vchan::server(0, 29, 4096, 4096).unwrap();
    let client = Vchan::client(0, 29).unwrap();
    wait_until(|| client.state() == State::Connected, "client to connect");

    assert_eq!(client.write(&[]).unwrap(), 0);
    assert_eq!(client.send(&[]).unwrap(), 0);
    let mut empty = [0u8; 0];
    assert_eq!(client.read(&mut empty).unwrap(), 0);
    assert_eq!(client.recv(&mut empty).unwrap(), 0);
    drop(server);
}
