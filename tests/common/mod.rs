//! Shared test infrastructure for resolution integration tests.

#![allow(dead_code)]

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse};
use hickory_server::proto::rr::Record;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tokio::sync::mpsc::UnboundedReceiver;

use binder_dns::directory::DirectoryEvent;
use binder_dns::hints::RootHints;
use binder_dns::memory::MemoryDirectory;
use binder_dns::resolver::Resolver;
use binder_dns::{BinderHandler, TreeCache};

// --- Constants ---

pub const ZONE: &str = "joyent.us";
pub const DATACENTER: &str = "coal";
pub const ROOT_DOMAIN: &str = "coal.joyent.us";

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// The response is serialized via `MessageResponse::destructive_emit()` and
/// stored as raw wire-format bytes, which can then be parsed with
/// `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(io::Error::other)?;
        Ok(info)
    }
}

// --- Directory fixture ---

/// An in-memory directory plus the tree mirroring it.
pub struct Fixture {
    pub directory: MemoryDirectory,
    pub events: UnboundedReceiver<DirectoryEvent>,
    pub cache: TreeCache,
}

impl Fixture {
    /// A fixture mirroring `root`.
    pub fn new(root: &str) -> Self {
        let (directory, events) = MemoryDirectory::new();
        let cache = TreeCache::new(Arc::new(directory.clone()), root);
        Self {
            directory,
            events,
            cache,
        }
    }

    /// Store a node by domain name.
    pub fn put(&mut self, domain: &str, json: &str) {
        self.directory
            .put(&binder_dns::name::domain_to_path(domain), json);
    }

    /// Apply every queued directory event to the tree.
    pub fn sync(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.cache.apply(event);
        }
    }

    /// Start a session and mirror the current directory.
    pub fn start(&mut self) {
        self.directory.establish_session();
        self.sync();
    }

    /// A handler without recursion.
    pub fn handler(&self, zone: Option<&str>) -> BinderHandler {
        let resolver = Resolver::new(
            self.cache.clone(),
            zone.map(String::from),
            Some(DATACENTER.to_string()),
            Arc::new(RootHints::embedded().unwrap()),
            false,
        );
        BinderHandler::new(resolver, None)
    }
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().unwrap()
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` from a fixed client address.
pub fn build_request(name: &str, record_type: RecordType, id: u16) -> Request {
    let bytes = build_query_bytes(name, record_type, id);
    let msg = parse_message_request(&bytes);
    let src: SocketAddr = "10.99.99.1:12345".parse().unwrap();
    Request::new(msg, src, Protocol::Udp)
}

// --- Response helpers ---

/// Execute a query through the handler and return the parsed response.
pub async fn execute_query(handler: &BinderHandler, name: &str, record_type: RecordType) -> Message {
    let request = build_request(name, record_type, 4242);
    let response = TestResponseHandler::new();
    handler.handle_request(&request, response.clone()).await;
    response.into_message()
}

/// Extract A addresses from the answer section.
pub fn extract_a_ips(msg: &Message) -> Vec<Ipv4Addr> {
    let mut ips: Vec<Ipv4Addr> = msg
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(a.0),
            _ => None,
        })
        .collect();
    ips.sort();
    ips
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}
