//! Integration coverage for concrete end-to-end scenarios: a real
//! `pgwire::Server` bound to a loopback TCP port, driven by a hand-rolled
//! client that speaks just enough of the wire protocol to exercise startup,
//! the simple query flow, the extended query flow, transaction/error-latch
//! behavior, and MD5 authentication.
//!
//! There's no PostgreSQL client driver dependency here on purpose: a real
//! driver hides exactly the message boundaries these tests need to assert
//! on (e.g. "RowDescription, then DataRow, then CommandComplete, then
//! ReadyForQuery, in that order").

use bytes::{BufMut, BytesMut};
use memstore::MemoryEngine;
use pgrepr::buf::{Cursor, PgBufMut};
use pgrepr::{Type, Value};
use pgwire::{Server, ServerConfig};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn start_server(passwords: Option<HashMap<String, String>>) -> (TcpStream, Arc<Server>) {
    let engine = MemoryEngine::new();
    engine.seed(
        "t1",
        vec![
            ("c1".to_string(), Type::Integer),
            ("c2".to_string(), Type::Text),
        ],
        vec![vec![Value::Int8(1), Value::Text("a".to_string())]],
    );

    let config = ServerConfig {
        bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        bind_port: 0,
        allow_non_loopback: false,
    };
    let server = Arc::new(Server::new(
        config,
        Arc::new(engine),
        None,
        HashMap::new(),
        passwords,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let spawned = Arc::clone(&server);
    tokio::spawn(async move {
        spawned.serve(listener, std::future::pending::<()>()).await;
    });

    let client = TcpStream::connect(addr).await.unwrap();
    (client, server)
}

/// A small client-side helper: writes frontend messages, reads and decodes
/// backend messages tag-by-tag. Deliberately doesn't reuse `pgwire::codec`'s
/// `Codec` (which only decodes frontend messages and only encodes backend
/// messages — the server-side direction); a real client needs the mirror
/// image, which this test supplies just enough of.
struct Client {
    stream: TcpStream,
}

#[derive(Debug, PartialEq)]
enum Backend {
    AuthenticationOk,
    AuthenticationMd5Password { salt: [u8; 4] },
    ParameterStatus { name: String, value: String },
    BackendKeyData { pid: u32, secret: u32 },
    ReadyForQuery(u8),
    RowDescription(Vec<(String, i32, i16)>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete(String),
    ErrorResponse(String),
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    EmptyQueryResponse,
}

impl Client {
    async fn send_startup(&mut self, params: &[(&str, &str)]) {
        let mut body = BytesMut::new();
        body.put_i32(196608); // protocol v3.0
        for (k, v) in params {
            body.put_cstr(k);
            body.put_cstr(v);
        }
        body.put_u8(0);
        let mut frame = BytesMut::new();
        frame.put_i32((body.len() + 4) as i32);
        frame.extend_from_slice(&body);
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn send_tagged(&mut self, tag: u8, body: &[u8]) {
        let mut frame = BytesMut::new();
        frame.put_u8(tag);
        frame.put_i32((body.len() + 4) as i32);
        frame.extend_from_slice(body);
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn query(&mut self, sql: &str) {
        let mut body = BytesMut::new();
        body.put_cstr(sql);
        self.send_tagged(b'Q', &body).await;
    }

    async fn parse(&mut self, name: &str, sql: &str, param_oids: &[i32]) {
        let mut body = BytesMut::new();
        body.put_cstr(name);
        body.put_cstr(sql);
        body.put_i16(param_oids.len() as i16);
        for oid in param_oids {
            body.put_i32(*oid);
        }
        self.send_tagged(b'P', &body).await;
    }

    async fn bind(
        &mut self,
        portal: &str,
        statement: &str,
        param_formats: &[i16],
        params: &[Option<&[u8]>],
        result_formats: &[i16],
    ) {
        let mut body = BytesMut::new();
        body.put_cstr(portal);
        body.put_cstr(statement);
        body.put_i16(param_formats.len() as i16);
        for f in param_formats {
            body.put_i16(*f);
        }
        body.put_i16(params.len() as i16);
        for p in params {
            body.put_field(*p);
        }
        body.put_i16(result_formats.len() as i16);
        for f in result_formats {
            body.put_i16(*f);
        }
        self.send_tagged(b'B', &body).await;
    }

    async fn describe_portal(&mut self, name: &str) {
        let mut body = BytesMut::new();
        body.put_u8(b'P');
        body.put_cstr(name);
        self.send_tagged(b'D', &body).await;
    }

    async fn execute(&mut self, portal: &str, max_rows: i32) {
        let mut body = BytesMut::new();
        body.put_cstr(portal);
        body.put_i32(max_rows);
        self.send_tagged(b'E', &body).await;
    }

    async fn sync(&mut self) {
        self.send_tagged(b'S', &[]).await;
    }

    async fn password(&mut self, hash: &str) {
        let mut body = BytesMut::new();
        body.put_cstr(hash);
        self.send_tagged(b'p', &body).await;
    }

    /// Reads and decodes one backend message, silently skipping over any
    /// `NoticeResponse` in the way (this core never emits one today, but a
    /// client that does would still need to keep reading past it).
    async fn recv(&mut self) -> Backend {
        loop {
            if let Some(message) = self.recv_one().await {
                return message;
            }
        }
    }

    async fn recv_one(&mut self) -> Option<Backend> {
        let mut head = [0u8; 5];
        self.stream.read_exact(&mut head).await.unwrap();
        let tag = head[0];
        let len = i32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize - 4;
        let mut payload = vec![0u8; len];
        if len > 0 {
            self.stream.read_exact(&mut payload).await.unwrap();
        }
        let mut cur = Cursor::new(&payload);
        Some(match tag {
            b'R' => {
                let kind = cur.read_i32().unwrap();
                if kind == 0 {
                    Backend::AuthenticationOk
                } else {
                    let bytes = cur.read_bytes(4).unwrap();
                    Backend::AuthenticationMd5Password {
                        salt: [bytes[0], bytes[1], bytes[2], bytes[3]],
                    }
                }
            }
            b'S' => Backend::ParameterStatus {
                name: cur.read_cstr().unwrap().to_string(),
                value: cur.read_cstr().unwrap().to_string(),
            },
            b'K' => Backend::BackendKeyData {
                pid: cur.read_u32().unwrap(),
                secret: cur.read_u32().unwrap(),
            },
            b'Z' => Backend::ReadyForQuery(cur.read_u8().unwrap()),
            b'T' => {
                let n = cur.read_i16().unwrap();
                let mut fields = Vec::new();
                for _ in 0..n {
                    let name = cur.read_cstr().unwrap().to_string();
                    let _table_oid = cur.read_i32().unwrap();
                    let _col_attr = cur.read_i16().unwrap();
                    let type_oid = cur.read_i32().unwrap();
                    let type_len = cur.read_i16().unwrap();
                    let _type_mod = cur.read_i32().unwrap();
                    let _format = cur.read_i16().unwrap();
                    fields.push((name, type_oid, type_len));
                }
                Backend::RowDescription(fields)
            }
            b'D' => {
                let n = cur.read_i16().unwrap();
                let mut values = Vec::new();
                for _ in 0..n {
                    let len = cur.read_i32().unwrap();
                    if len < 0 {
                        values.push(None);
                    } else {
                        values.push(Some(cur.read_bytes(len as usize).unwrap().to_vec()));
                    }
                }
                Backend::DataRow(values)
            }
            b'C' => Backend::CommandComplete(cur.read_cstr().unwrap().to_string()),
            b'I' => Backend::EmptyQueryResponse,
            b'E' => Backend::ErrorResponse(read_error_message(&mut cur)),
            b'N' => {
                read_error_message(&mut cur);
                return None;
            }
            b'1' => Backend::ParseComplete,
            b'2' => Backend::BindComplete,
            b'3' => Backend::CloseComplete,
            b'n' => Backend::NoData,
            b's' => Backend::PortalSuspended,
            other => panic!("unexpected backend message tag {:?}", other as char),
        })
    }
}

fn read_error_message(cur: &mut Cursor<'_>) -> String {
    loop {
        let field = cur.read_u8().unwrap();
        if field == 0 {
            return String::new();
        }
        let value = cur.read_cstr().unwrap().to_string();
        if field == b'M' {
            // Drain the remaining fields so the next `recv` starts clean.
            let mut rest = cur.remaining();
            while !rest.is_empty() && rest[0] != 0 {
                let nul = rest.iter().position(|b| *b == 0).unwrap();
                rest = &rest[nul + 1..];
            }
            return value;
        }
    }
}

async fn connect_and_start_up(passwords: Option<HashMap<String, String>>) -> Client {
    let (stream, _server) = start_server(passwords).await;
    let mut client = Client { stream };
    client
        .send_startup(&[("user", "alice"), ("database", "test")])
        .await;
    client
}

impl Client {
    /// Asserts the startup sequence requires:
    /// AuthenticationOk, one ParameterStatus per connection parameter (in
    /// the order the backend declared them), BackendKeyData, then
    /// ReadyForQuery — and nothing else interleaved.
    async fn expect_startup(&mut self, param_count: usize) {
        assert_eq!(self.recv().await, Backend::AuthenticationOk);
        for _ in 0..param_count {
            assert!(matches!(self.recv().await, Backend::ParameterStatus { .. }));
        }
        assert!(matches!(self.recv().await, Backend::BackendKeyData { .. }));
        assert_eq!(self.recv().await, Backend::ReadyForQuery(b'I'));
    }
}

/// S1 "Happy select": a plain `SELECT` over the simple query protocol.
#[tokio::test]
async fn happy_select_over_simple_query() {
    let mut client = connect_and_start_up(None).await;
    client.expect_startup(3).await;

    client.query("SELECT 1").await;
    assert!(matches!(client.recv().await, Backend::RowDescription(_)));
    assert_eq!(
        client.recv().await,
        Backend::DataRow(vec![Some(b"1".to_vec())])
    );
    match client.recv().await {
        Backend::CommandComplete(tag) => assert_eq!(tag, "SELECT 1"),
        other => panic!("expected CommandComplete, got {:?}", other),
    }
    assert_eq!(client.recv().await, Backend::ReadyForQuery(b'I'));
}

#[tokio::test]
async fn select_over_a_table_round_trips_rows() {
    let mut client = connect_and_start_up(None).await;
    client.expect_startup(3).await;

    client.query("SELECT c1, c2 FROM t1").await;
    match client.recv().await {
        Backend::RowDescription(fields) => {
            assert_eq!(fields.len(), 2);
            assert_eq!(fields[0].1, 23); // Type::Integer OID
        }
        other => panic!("expected RowDescription, got {:?}", other),
    }
    assert_eq!(
        client.recv().await,
        Backend::DataRow(vec![Some(b"1".to_vec()), Some(b"a".to_vec())])
    );
    match client.recv().await {
        Backend::CommandComplete(tag) => assert_eq!(tag, "SELECT 1"),
        other => panic!("expected CommandComplete, got {:?}", other),
    }
    assert_eq!(client.recv().await, Backend::ReadyForQuery(b'I'));
}

/// S2 "Parameterized extended": Parse/Bind/Describe/Execute/Sync for a
/// statement bound to one text parameter.
#[tokio::test]
async fn parameterized_extended_query() {
    let mut client = connect_and_start_up(None).await;
    client.expect_startup(3).await;

    client.parse("", "SELECT $1::int", &[]).await;
    assert_eq!(client.recv().await, Backend::ParseComplete);

    client
        .bind("", "", &[0], &[Some(b"7")], &[0])
        .await;
    assert_eq!(client.recv().await, Backend::BindComplete);

    client.describe_portal("").await;
    assert!(matches!(client.recv().await, Backend::RowDescription(_)));

    client.execute("", 0).await;
    assert_eq!(
        client.recv().await,
        Backend::DataRow(vec![Some(b"7".to_vec())])
    );
    match client.recv().await {
        Backend::CommandComplete(tag) => assert_eq!(tag, "SELECT 1"),
        other => panic!("expected CommandComplete, got {:?}", other),
    }

    client.sync().await;
    assert_eq!(client.recv().await, Backend::ReadyForQuery(b'I'));
}

/// S3 "Transaction and rollback": an error mid-transaction latches
/// `has_error` until the next Sync, and `transaction_status` tracks it.
#[tokio::test]
async fn transaction_error_latches_until_rollback() {
    let mut client = connect_and_start_up(None).await;
    client.expect_startup(3).await;

    client.query("BEGIN").await;
    match client.recv().await {
        Backend::CommandComplete(tag) => assert_eq!(tag, "BEGIN"),
        other => panic!("expected CommandComplete(BEGIN), got {:?}", other),
    }
    assert_eq!(client.recv().await, Backend::ReadyForQuery(b'T'));

    client.query("SELECT * FROM does_not_exist").await;
    assert!(matches!(client.recv().await, Backend::ErrorResponse(_)));
    assert_eq!(client.recv().await, Backend::ReadyForQuery(b'E'));

    client.query("ROLLBACK").await;
    match client.recv().await {
        Backend::CommandComplete(tag) => assert_eq!(tag, "ROLLBACK"),
        other => panic!("expected CommandComplete(ROLLBACK), got {:?}", other),
    }
    assert_eq!(client.recv().await, Backend::ReadyForQuery(b'I'));
}

/// S5 "MD5 auth success/failure".
#[tokio::test]
async fn md5_auth_success_and_failure() {
    let mut passwords = HashMap::new();
    passwords.insert("alice".to_string(), "secret".to_string());

    let (stream, _server) = start_server(Some(passwords)).await;
    let mut client = Client { stream };
    client.send_startup(&[("user", "alice")]).await;

    let salt = match client.recv().await {
        Backend::AuthenticationMd5Password { salt } => salt,
        other => panic!("expected AuthenticationMD5Password, got {:?}", other),
    };

    let inner = md5_hex(&[b"secret", b"alice"]);
    let hash = format!("md5{}", md5_hex(&[inner.as_bytes(), &salt]));
    client.password(&hash).await;
    client.expect_startup(3).await;
}

#[tokio::test]
async fn md5_auth_rejects_wrong_password() {
    let mut passwords = HashMap::new();
    passwords.insert("alice".to_string(), "secret".to_string());

    let (stream, _server) = start_server(Some(passwords)).await;
    let mut client = Client { stream };
    client.send_startup(&[("user", "alice")]).await;

    assert!(matches!(
        client.recv().await,
        Backend::AuthenticationMd5Password { .. }
    ));
    client.password("md5deadbeefdeadbeefdeadbeefdeadbeef").await;
    assert!(matches!(client.recv().await, Backend::ErrorResponse(_)));
}

fn md5_hex(chunks: &[&[u8]]) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    format!("{:x}", hasher.finalize())
}
