//! End-to-end exercise over real sockets: one server, several client
//! conversations covering file serving, keep-alive reuse, the error pages
//! and the credential routes.

use std::fs;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mux_web_server::config::{Config, DispatchMode};
use mux_web_server::server::Server;
use mux_web_server::store::UserDb;

fn temp_root(tag: &str) -> PathBuf {
    let nanos =
        SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch").subsec_nanos();
    let dir =
        std::env::temp_dir().join(format!("muxweb-e2e-{tag}-{}-{nanos}", std::process::id()));
    fs::create_dir_all(&dir).expect("create doc root");
    dir
}

fn write_page(root: &Path, name: &str, body: &str) {
    fs::write(root.join(name), body).expect("write page");
}

fn read_retry(stream: &mut TcpStream, buf: &mut [u8]) -> usize {
    loop {
        match stream.read(buf) {
            Ok(n) => return n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("client read failed: {e}"),
        }
    }
}

fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("Content-Length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0)
}

/// Read exactly one response: the header block, then Content-Length body
/// bytes. Returns (head, body).
fn read_response(stream: &mut TcpStream) -> (String, String) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = read_retry(stream, &mut chunk);
        assert!(n > 0, "peer closed before the header block completed");
        buf.extend_from_slice(&chunk[..n]);
    };
    let head = String::from_utf8(buf[..header_end].to_vec()).expect("header block is UTF-8");
    let mut body = buf[header_end + 4..].to_vec();
    let want = content_length(&head);
    while body.len() < want {
        let n = read_retry(stream, &mut chunk);
        assert!(n > 0, "peer closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    (head, String::from_utf8(body).expect("body is UTF-8"))
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.set_read_timeout(Some(Duration::from_secs(5))).expect("set timeout");
    stream
}

fn request(stream: &mut TcpStream, req: &str) -> (String, String) {
    stream.write_all(req.as_bytes()).expect("client write");
    read_response(stream)
}

fn assert_closed(stream: &mut TcpStream) {
    let mut chunk = [0u8; 16];
    match stream.read(&mut chunk) {
        Ok(0) => {}
        Ok(n) => panic!("expected close, got {n} more bytes"),
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("expected close, got {e}"),
    }
}

#[test]
fn end_to_end() {
    let root = temp_root("full");
    write_page(&root, "index.html", "<html><body>landing</body></html>");
    write_page(&root, "hello.html", "<html><body>hello</body></html>");
    write_page(&root, "welcome.html", "<html><body>welcome</body></html>");
    write_page(&root, "login.html", "<html><body>login form</body></html>");
    write_page(&root, "login_error.html", "<html><body>bad credentials</body></html>");

    let db = Arc::new(UserDb::new());
    db.seed([("admin", "secret")]);

    let cfg = Config {
        port: 0,
        doc_root: root.clone(),
        workers: 2,
        store_size: 2,
        // Long tick so the idle reaper stays out of the way, orderly close
        // so clients see FIN rather than RST.
        tick_secs: 60,
        graceful_linger: true,
        ..Config::default()
    };
    let mut server = Server::new(cfg, db).expect("server setup");
    let port = server.local_addr().expect("local addr").port();
    std::thread::spawn(move || {
        let _ = server.run();
    });

    // Keep-alive: two requests over one socket, landing-page rewrite for `/`.
    let mut stream = connect(port);
    let (head, body) =
        request(&mut stream, "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");
    assert!(head.contains("Connection: keep-alive"));
    assert_eq!(body, "<html><body>landing</body></html>");
    let (head, body) = request(
        &mut stream,
        "GET /hello.html HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(body, "<html><body>hello</body></html>");
    drop(stream);

    // Missing file: the fixed 404 page, then the server hangs up.
    let mut stream = connect(port);
    let (head, body) =
        request(&mut stream, "GET /nofile.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 404"), "unexpected head: {head}");
    assert_eq!(body, "The requested file was not found on this server.\n");
    assert_closed(&mut stream);

    // Unknown method: 400, never kept alive even when the client asks.
    let mut stream = connect(port);
    let (head, body) = request(
        &mut stream,
        "FOO / HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 400"), "unexpected head: {head}");
    assert!(head.contains("Connection: close"));
    assert_eq!(body, "Your request has bad syntax or is inherently impossible to satisfy.\n");
    assert_closed(&mut stream);

    // Credential routes: matching pair lands on the welcome page, a wrong
    // password on the error page.
    let mut stream = connect(port);
    let form = "user=admin&password=secret";
    let (head, body) = request(
        &mut stream,
        &format!(
            "POST /login HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{form}",
            form.len()
        ),
    );
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");
    assert_eq!(body, "<html><body>welcome</body></html>");
    drop(stream);

    let mut stream = connect(port);
    let form = "user=admin&password=guess";
    let (_, body) = request(
        &mut stream,
        &format!(
            "POST /login HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{form}",
            form.len()
        ),
    );
    assert_eq!(body, "<html><body>bad credentials</body></html>");
    drop(stream);

    // Concurrent clients on distinct files: buffers never bleed across
    // connections.
    let fetchers: Vec<_> = [("index.html", "landing"), ("hello.html", "hello")]
        .into_iter()
        .map(|(file, word)| {
            std::thread::spawn(move || {
                let mut stream = connect(port);
                for _ in 0..5 {
                    let (head, body) = request(
                        &mut stream,
                        &format!(
                            "GET /{file} HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n"
                        ),
                    );
                    assert!(head.starts_with("HTTP/1.1 200"));
                    assert_eq!(body, format!("<html><body>{word}</body></html>"));
                }
            })
        })
        .collect();
    for f in fetchers {
        f.join().expect("fetcher thread");
    }

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn reactor_dispatch_serves_and_closes() {
    let root = temp_root("reactor");
    write_page(&root, "index.html", "<html><body>reactor</body></html>");

    let cfg = Config {
        port: 0,
        doc_root: root.clone(),
        workers: 2,
        store_size: 2,
        dispatch: DispatchMode::Reactor,
        tick_secs: 60,
        graceful_linger: true,
        ..Config::default()
    };
    let mut server = Server::new(cfg, Arc::new(UserDb::new())).expect("server setup");
    let port = server.local_addr().expect("local addr").port();
    std::thread::spawn(move || {
        let _ = server.run();
    });

    // Workers perform the socket I/O here; two requests over one socket
    // prove the completion handshake re-arms read interest correctly.
    let mut stream = connect(port);
    let (head, body) =
        request(&mut stream, "GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");
    assert_eq!(body, "<html><body>reactor</body></html>");
    let (head, _) = request(
        &mut stream,
        "GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.1 200"));
    drop(stream);

    // Half a request then FIN: the worker's failed read routes the loop to
    // the close path rather than stranding the socket.
    let mut stream = connect(port);
    stream.write_all(b"GET /index.html HT").expect("client write");
    stream.shutdown(std::net::Shutdown::Write).expect("shutdown write");
    assert_closed(&mut stream);

    // And the server keeps serving new clients afterwards.
    let mut stream = connect(port);
    let (head, _) = request(&mut stream, "GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 200"));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn capacity_overflow_gets_the_busy_line() {
    let root = temp_root("busy");
    write_page(&root, "index.html", "<html><body>one seat</body></html>");

    let cfg = Config {
        port: 0,
        doc_root: root.clone(),
        workers: 1,
        store_size: 1,
        max_clients: 1,
        tick_secs: 60,
        graceful_linger: true,
        ..Config::default()
    };
    let mut server = Server::new(cfg, Arc::new(UserDb::new())).expect("server setup");
    let port = server.local_addr().expect("local addr").port();
    std::thread::spawn(move || {
        let _ = server.run();
    });

    // Occupy the only seat with a completed keep-alive request.
    let mut first = connect(port);
    let (head, _) =
        request(&mut first, "GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");
    assert!(head.starts_with("HTTP/1.1 200"));

    // The next client gets the raw busy line, no HTTP framing, then a close.
    let mut second = connect(port);
    let mut got = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        match second.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => got.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => break,
            Err(e) => panic!("client read failed: {e}"),
        }
    }
    assert_eq!(got, b"Internal server busy".to_vec());

    let _ = fs::remove_dir_all(&root);
}
