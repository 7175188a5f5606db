//! Serves a calculator and calls it over both wire formats.

use std::time::Duration;

use async_trait::async_trait;
use wirecall_rpc::{
    DispatchEntry, Error, Exception, Framing, InterfaceDef, MethodSignature, Primitive,
    RpcRuntime, ServerConfig, Service, TypeDesc, Value, WireFormat, WireValue,
};

struct Calculator;

#[async_trait]
impl Service for Calculator {
    async fn call(&self, method: &DispatchEntry, args: Vec<Value>) -> wirecall_rpc::Result<Value> {
        let mut args = args.into_iter();
        match method.signature().name() {
            "add" => {
                let a = i32::from_value(args.next().unwrap_or(Value::Null))?;
                let b = i32::from_value(args.next().unwrap_or(Value::Null))?;
                Ok(Value::Int(a.wrapping_add(b)))
            }
            "divide" => {
                let a = i32::from_value(args.next().unwrap_or(Value::Null))?;
                let b = i32::from_value(args.next().unwrap_or(Value::Null))?;
                a.checked_div(b).map(Value::Int).ok_or_else(|| {
                    Error::Application(Exception::new("ArithmeticError", "division by zero"))
                })
            }
            other => Err(Error::Internal(format!("unimplemented: {other}"))),
        }
    }
}

fn interface() -> InterfaceDef {
    let int = TypeDesc::Primitive(Primitive::Int);
    InterfaceDef::new("Calculator")
        .method(
            MethodSignature::new("add")
                .param(int.clone())
                .param(int.clone())
                .returns(int.clone()),
        )
        .method(
            MethodSignature::new("divide")
                .param(int.clone())
                .param(int.clone())
                .returns(int)
                .throws("ArithmeticError"),
        )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let runtime = RpcRuntime::builder().max_workers(8).build()?;

    for (format, framing) in [
        (WireFormat::Binary, Framing::length_prefixed()),
        (WireFormat::Json, Framing::delimited()),
    ] {
        let server = runtime.server(&interface(), Calculator)?.with_config(ServerConfig {
            framing,
            wire_format: format,
            ..ServerConfig::default()
        })?;
        let address = server.expose("127.0.0.1:0").await?;

        let client = runtime
            .client()
            .address(address.to_string())
            .interface(interface())
            .wire_format(format)
            .framing(framing)
            .call_timeout(Duration::from_secs(5))
            .build()?;

        let sum: i32 = client
            .invoke_as("add", vec![Value::Int(40), Value::Int(2)])
            .await?;
        tracing::info!(?format, sum, "add(40, 2)");

        match client
            .invoke("divide", vec![Value::Int(1), Value::Int(0)])
            .await
        {
            Err(error) => tracing::info!(?format, %error, "divide(1, 0) raised"),
            Ok(value) => tracing::warn!(?format, ?value, "divide(1, 0) returned"),
        }

        client.shutdown();
        server.unexpose().await;
    }

    Ok(())
}
