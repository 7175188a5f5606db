//! Calculator service shared by the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use wirecall_rpc::{
    DispatchEntry, Error, Exception, Framing, InterfaceDef, MethodSignature, Primitive, Result,
    RpcClient, RpcRuntime, RpcServer, ServerConfig, Service, TypeDesc, Value, WireFormat,
    WireValue,
};

pub const INT: TypeDesc = TypeDesc::Primitive(Primitive::Int);

pub fn calculator() -> InterfaceDef {
    InterfaceDef::new("Calculator")
        .method(MethodSignature::new("add").param(INT).param(INT).returns(INT))
        .method(MethodSignature::new("throwException").throws("Exception"))
        .method(
            MethodSignature::new("raise")
                .param(TypeDesc::String)
                .param(TypeDesc::String)
                .throws("E"),
        )
        .method(
            MethodSignature::new("echo")
                .param(TypeDesc::Object)
                .returns(TypeDesc::Object),
        )
        .method(MethodSignature::new("sleep").param(TypeDesc::Primitive(Primitive::Long)))
}

pub struct Calculator;

#[async_trait::async_trait]
impl Service for Calculator {
    async fn call(&self, method: &DispatchEntry, args: Vec<Value>) -> Result<Value> {
        let mut args = args.into_iter();
        let mut next = || args.next().unwrap_or(Value::Null);

        match method.signature().name() {
            "add" => {
                let a = i32::from_value(next())?;
                let b = i32::from_value(next())?;
                Ok(Value::Int(a.wrapping_add(b)))
            }
            "throwException" => Err(Error::Application(Exception::new(
                "Exception",
                "test exception",
            ))),
            "raise" => {
                let kind = String::from_value(next())?;
                let message = String::from_value(next())?;
                Err(Error::Application(Exception::new(kind, message)))
            }
            "echo" => Ok(next()),
            "sleep" => {
                let millis = i64::from_value(next())?;
                tokio::time::sleep(Duration::from_millis(millis.unsigned_abs())).await;
                Ok(Value::Unit)
            }
            other => Err(Error::Internal(format!("no implementation for {other}"))),
        }
    }
}

pub fn framing_for(format: WireFormat) -> Framing {
    match format {
        WireFormat::Binary => Framing::length_prefixed(),
        WireFormat::Json => Framing::delimited(),
    }
}

pub async fn start_server(runtime: &RpcRuntime, format: WireFormat) -> (RpcServer, String) {
    let server = runtime
        .server(&calculator(), Calculator)
        .unwrap()
        .with_config(ServerConfig {
            framing: framing_for(format),
            wire_format: format,
            ..ServerConfig::default()
        })
        .unwrap();
    let address = server.expose("127.0.0.1:0").await.unwrap();
    (server, address.to_string())
}

pub fn client(runtime: &RpcRuntime, format: WireFormat, address: &str) -> RpcClient {
    runtime
        .client()
        .address(address)
        .interface(calculator())
        .wire_format(format)
        .framing(framing_for(format))
        .build()
        .unwrap()
}

pub async fn start(format: WireFormat) -> (RpcServer, RpcClient) {
    let runtime = RpcRuntime::new();
    let (server, address) = start_server(&runtime, format).await;
    let client = client(&runtime, format, &address);
    (server, client)
}

pub async fn add(client: &RpcClient, a: i32, b: i32) -> Result<i32> {
    client
        .invoke_as("add", vec![Value::Int(a), Value::Int(b)])
        .await
}
