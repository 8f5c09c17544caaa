//! Raw backend stubs
//!
//! A [`ServiceStub`] is the unwrapped call surface of one backend service:
//! JSON request in, JSON response out, failures reported as `tonic::Status`.
//! [`GrpcStub`] implements it with a dynamic unary call driven by protobuf
//! descriptors, so the gateway needs no generated client code per service.

use crate::error::{Error, Result};
use crate::registry::ServiceDescriptor;
use async_trait::async_trait;
use bytes::Buf;
use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, Kind, MessageDescriptor, ReflectMessage};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::{Channel, Endpoint};
use tonic::Status;
use tracing::{debug, info};

/// Per-call options passed down to a stub
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    pub deadline: Duration,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(10),
        }
    }
}

/// Unwrapped call surface of one backend service
#[async_trait]
pub trait ServiceStub: Send + Sync {
    /// Invoke a unary remote method
    async fn invoke(
        &self,
        method: &str,
        request: serde_json::Value,
        options: CallOptions,
    ) -> std::result::Result<serde_json::Value, Status>;

    /// Release the underlying connection
    async fn close(&self) {}
}

/// Builds stubs for resolved service targets
#[async_trait]
pub trait StubConnector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ServiceDescriptor,
        target: &str,
    ) -> Result<Arc<dyn ServiceStub>>;
}

/// Dynamic gRPC stub over a lazily connected channel
pub struct GrpcStub {
    channel: Channel,
    service: prost_reflect::ServiceDescriptor,
    target: String,
    closed: AtomicBool,
}

impl GrpcStub {
    pub fn new(
        channel: Channel,
        service: prost_reflect::ServiceDescriptor,
        target: String,
    ) -> Self {
        Self {
            channel,
            service,
            target,
            closed: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn method(&self, name: &str) -> std::result::Result<prost_reflect::MethodDescriptor, Status> {
        self.service
            .methods()
            .find(|m| m.name() == name)
            .ok_or_else(|| {
                Status::unimplemented(format!(
                    "{} has no method {}",
                    self.service.full_name(),
                    name
                ))
            })
    }
}

#[async_trait]
impl ServiceStub for GrpcStub {
    async fn invoke(
        &self,
        method: &str,
        request: serde_json::Value,
        options: CallOptions,
    ) -> std::result::Result<serde_json::Value, Status> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Status::unavailable(format!("client for {} is closed", self.target)));
        }

        let method = self.method(method)?;
        let message = json_to_message(method.input(), request)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let path: http::uri::PathAndQuery =
            format!("/{}/{}", self.service.full_name(), method.name())
                .parse()
                .map_err(|e| Status::internal(format!("invalid gRPC path: {e}")))?;

        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("gRPC not ready: {e}")))?;

        let mut request = tonic::Request::new(message);
        request.set_timeout(options.deadline);

        let response = grpc
            .unary(request, path, DynamicCodec::new(method.output()))
            .await?;

        Ok(message_to_json(&response.into_inner()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        debug!(endpoint = %self.target, "gRPC stub closed");
    }
}

/// Connector resolving services in a compiled descriptor pool
#[derive(Clone)]
pub struct GrpcStubConnector {
    pool: Option<DescriptorPool>,
    connect_timeout: Duration,
}

impl GrpcStubConnector {
    pub fn new(pool: DescriptorPool) -> Self {
        Self {
            pool: Some(pool),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Connector without descriptors; every connection attempt fails
    pub fn empty() -> Self {
        Self {
            pool: None,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Decode a serialized `FileDescriptorSet`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let pool = DescriptorPool::decode(bytes)
            .map_err(|e| Error::Descriptor(format!("invalid descriptor set: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Load a `FileDescriptorSet` from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            Error::Descriptor(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Find the service by its qualified name, then by bare name in any package
    fn find_service(
        &self,
        descriptor: &ServiceDescriptor,
    ) -> Result<prost_reflect::ServiceDescriptor> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| Error::Descriptor("no descriptor set configured".to_string()))?;

        if let Some(service) = pool.get_service_by_name(&descriptor.full_service_name()) {
            return Ok(service);
        }

        pool.services()
            .find(|s| s.name() == descriptor.service)
            .ok_or_else(|| {
                let packages: Vec<_> = pool.files().map(|f| f.package_name().to_string()).collect();
                Error::Descriptor(format!(
                    "service {} not found in descriptor set (packages: {})",
                    descriptor.full_service_name(),
                    packages.join(", ")
                ))
            })
    }
}

#[async_trait]
impl StubConnector for GrpcStubConnector {
    async fn connect(
        &self,
        descriptor: &ServiceDescriptor,
        target: &str,
    ) -> Result<Arc<dyn ServiceStub>> {
        let service = self.find_service(descriptor)?;

        let channel = Endpoint::from_shared(target.to_string())?
            .connect_timeout(self.connect_timeout)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(5))
            .keep_alive_while_idle(true)
            .connect_lazy();

        info!(
            service = %descriptor.name,
            grpc_service = %service.full_name(),
            endpoint = %target,
            "gRPC client configured"
        );

        Ok(Arc::new(GrpcStub::new(channel, service, target.to_string())))
    }
}

/// Build a request message from JSON; accepts camelCase and proto field names
pub fn json_to_message(desc: MessageDescriptor, json: serde_json::Value) -> Result<DynamicMessage> {
    DynamicMessage::deserialize(desc, json)
        .map_err(|e| Error::Internal(format!("request does not match message: {e}")))
}

/// Render a message as JSON with camelCase keys; unset fields carry defaults
pub fn message_to_json(msg: &DynamicMessage) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for field in msg.descriptor().fields() {
        let value = msg.get_field(&field);
        obj.insert(field.json_name().to_string(), value_to_json(&value, &field.kind()));
    }
    serde_json::Value::Object(obj)
}

fn value_to_json(value: &prost_reflect::Value, kind: &Kind) -> serde_json::Value {
    use prost_reflect::Value;

    match value {
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::I32(n) => serde_json::json!(*n),
        Value::I64(n) => serde_json::json!(*n),
        Value::U32(n) => serde_json::json!(*n),
        Value::U64(n) => serde_json::json!(*n),
        Value::F32(n) => serde_json::json!(*n),
        Value::F64(n) => serde_json::json!(*n),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::String(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            b,
        )),
        Value::EnumNumber(n) => match kind {
            Kind::Enum(desc) => desc
                .get_value(*n)
                .map(|v| serde_json::Value::String(v.name().to_string()))
                .unwrap_or_else(|| serde_json::json!(*n)),
            _ => serde_json::json!(*n),
        },
        Value::Message(msg) => message_to_json(msg),
        Value::List(list) => {
            serde_json::Value::Array(list.iter().map(|v| value_to_json(v, kind)).collect())
        }
        Value::Map(map) => {
            let value_kind = match kind {
                Kind::Message(entry) => entry.map_entry_value_field().kind(),
                other => other.clone(),
            };
            let mut obj = serde_json::Map::new();
            for (k, v) in map.iter() {
                let key = match k {
                    prost_reflect::MapKey::Bool(b) => b.to_string(),
                    prost_reflect::MapKey::I32(n) => n.to_string(),
                    prost_reflect::MapKey::I64(n) => n.to_string(),
                    prost_reflect::MapKey::U32(n) => n.to_string(),
                    prost_reflect::MapKey::U64(n) => n.to_string(),
                    prost_reflect::MapKey::String(s) => s.clone(),
                };
                obj.insert(key, value_to_json(v, &value_kind));
            }
            serde_json::Value::Object(obj)
        }
    }
}

/// Codec for dynamic protobuf messages
#[derive(Clone)]
struct DynamicCodec {
    output: MessageDescriptor,
}

impl DynamicCodec {
    fn new(output: MessageDescriptor) -> Self {
        Self { output }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            desc: self.output.clone(),
        }
    }
}

struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("encode error: {e}")))
    }
}

struct DynamicDecoder {
    desc: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    // The buffer holds exactly one message; zero bytes is a valid empty message
    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        let bytes = src.copy_to_bytes(src.remaining());
        let msg = DynamicMessage::decode(self.desc.clone(), bytes)
            .map_err(|e| Status::internal(format!("decode error: {e}")))?;
        Ok(Some(msg))
    }
}
