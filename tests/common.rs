//! Shared harness for the integration suites: a demo registry served
//! over an in-process transport pair.

#![allow(missing_docs, reason = "test helpers")]
#![allow(dead_code, reason = "each suite uses a subset of the harness")]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicI64, Ordering},
};

use janus::{
    client::Client,
    coerce::ShmConfig,
    error::ErrorPayload,
    protocol::{OptionFlags, SessionOptions},
    runtime::{
        MethodSpec, NativeValue, ObjectInstance, ProxyObject, Registry, invocation_error,
        sync_method,
    },
    server::{Server, SessionHandle},
    transport::Transport,
    types::TypeId,
};

/// The demo object every suite talks to.
#[derive(Debug, Default)]
pub struct Calculator {
    pub total: AtomicI64,
    pub label: Mutex<String>,
}

fn int_args(args: &[NativeValue]) -> Result<Vec<i64>, ErrorPayload> {
    args.iter()
        .map(|a| {
            a.as_i64()
                .ok_or_else(|| invocation_error("expected an integer argument"))
        })
        .collect()
}

/// Build the demo registry: an interface for callbacks plus a calculator
/// with contested overloads and container-shaped helpers. Returns the
/// registry and the calculator/interface type ids.
pub fn demo_registry() -> (Registry, TypeId, TypeId) {
    let mut b = Registry::builder();
    let transform = b.declare_interface("demo.Transform");
    let calc = b.declare("demo.Calculator");

    b.class(transform)
        .abstract_method(MethodSpec::new("apply", &[TypeId::OBJECT], TypeId::OBJECT));

    b.class(calc)
        .ctor(
            &[],
            sync_method(move |_, _| {
                Ok(NativeValue::Object(ObjectInstance::new(
                    calc,
                    Calculator::default(),
                )))
            }),
        )
        .ctor(
            &[TypeId::I64],
            sync_method(move |_, args| {
                let start = args
                    .first()
                    .and_then(NativeValue::as_i64)
                    .ok_or_else(|| invocation_error("missing initial total"))?;
                let calc_obj = Calculator::default();
                calc_obj.total.store(start, Ordering::Relaxed);
                Ok(NativeValue::Object(ObjectInstance::new(calc, calc_obj)))
            }),
        )
        .method(
            MethodSpec::new("add", &[TypeId::I32, TypeId::I32], TypeId::I32),
            sync_method(|recv, args| {
                let sum = int_args(&args)?.iter().sum::<i64>();
                if let Some(calc_obj) = recv.as_ref().and_then(|r| r.downcast::<Calculator>()) {
                    calc_obj.total.fetch_add(sum, Ordering::Relaxed);
                }
                Ok(NativeValue::I32(i32::try_from(sum).unwrap_or(i32::MAX)))
            }),
        )
        .method(
            MethodSpec::new("f", &[TypeId::I32, TypeId::F64], TypeId::STRING),
            sync_method(|_, _| Ok(NativeValue::Str("f(int,double)".to_owned()))),
        )
        .method(
            MethodSpec::new("f", &[TypeId::F64, TypeId::I32], TypeId::STRING),
            sync_method(|_, _| Ok(NativeValue::Str("f(double,int)".to_owned()))),
        )
        .method(
            MethodSpec::new("total", &[], TypeId::I64),
            sync_method(|recv, _| {
                let calc_obj = recv
                    .as_ref()
                    .and_then(|r| r.downcast::<Calculator>())
                    .ok_or_else(|| invocation_error("receiver is not a Calculator"))?;
                Ok(NativeValue::I64(calc_obj.total.load(Ordering::Relaxed)))
            }),
        )
        .method(
            MethodSpec::new("sort", &[TypeId::SEQUENCE], TypeId::SEQUENCE),
            sync_method(|_, mut args| {
                let NativeValue::List(mut items) = args.remove(0) else {
                    return Err(invocation_error("expected a sequence"));
                };
                // The received list is a detached copy; sorting it cannot
                // touch the caller's container.
                items.sort_by_key(|v| v.as_i64().unwrap_or(i64::MAX));
                Ok(NativeValue::List(items))
            }),
        )
        .method(
            MethodSpec::new("echoArray", &[TypeId::SEQUENCE], TypeId::SEQUENCE),
            sync_method(|_, mut args| Ok(args.remove(0))),
        )
        .method(
            MethodSpec::new("apply", &[transform, TypeId::I64], TypeId::OBJECT),
            Arc::new(|_, mut args: Vec<NativeValue>| {
                Box::pin(async move {
                    let value = args
                        .get(1)
                        .and_then(NativeValue::as_i64)
                        .ok_or_else(|| invocation_error("missing value argument"))?;
                    let proxy = args
                        .remove(0)
                        .as_object()
                        .and_then(|o| o.downcast::<ProxyObject>().cloned())
                        .ok_or_else(|| invocation_error("expected a Transform"))?;
                    proxy
                        .callback
                        .call("apply", vec![NativeValue::I64(value)])
                        .await
                })
            }),
        )
        .field(
            "label",
            TypeId::STRING,
            Arc::new(|obj: &ObjectInstance| {
                let calc_obj = obj
                    .downcast::<Calculator>()
                    .ok_or_else(|| invocation_error("not a Calculator"))?;
                let label = calc_obj
                    .label
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                Ok(NativeValue::Str(label.clone()))
            }),
            Some(Arc::new(|obj: &ObjectInstance, value: NativeValue| {
                let calc_obj = obj
                    .downcast::<Calculator>()
                    .ok_or_else(|| invocation_error("not a Calculator"))?;
                let text = value
                    .as_str()
                    .ok_or_else(|| invocation_error("label must be a string"))?
                    .to_owned();
                *calc_obj
                    .label
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = text;
                Ok(())
            })),
        )
        .snapshot(Arc::new(|obj: &ObjectInstance| {
            obj.downcast::<Calculator>()
                .map(|c| NativeValue::I64(c.total.load(Ordering::Relaxed)))
        }));

    let registry = b.build().expect("demo registry builds");
    registry.publish("calc", ObjectInstance::new(calc, Calculator::default()));
    (registry, calc, transform)
}

/// A connected client/server pair over an in-process transport.
pub struct Harness {
    pub server: Arc<Server>,
    pub session: SessionHandle,
    pub client: Client,
}

/// Connect with explicit options, an optional shared-memory override,
/// and arbitrary server configuration.
pub async fn connect_with(
    offer: SessionOptions,
    shm: Option<ShmConfig>,
    configure: impl FnOnce(Server) -> Server,
) -> Harness {
    let (registry, _, _) = demo_registry();
    let mut server = Server::new(Arc::new(registry));
    if let Some(cfg) = &shm {
        server = server.with_shm(Some(cfg.clone()));
    }
    let server = Arc::new(configure(server));
    let (client_end, server_end) = Transport::pair(1 << 16);
    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve_transport(server_end).await })
    };
    let client = match shm {
        Some(cfg) => Client::connect_with_shm(client_end, "itest", offer, cfg)
            .await
            .expect("client connects"),
        None => Client::connect(client_end, "itest", offer)
            .await
            .expect("client connects"),
    };
    let session = serving
        .await
        .expect("server task")
        .expect("server handshake");
    Harness {
        server,
        session,
        client,
    }
}

/// Default connection: four workers, callbacks and shared memory on.
pub async fn connect() -> Harness {
    connect_with(
        SessionOptions {
            num_workers: 4,
            flags: OptionFlags::USE_SHM | OptionFlags::CALLBACKS,
        },
        None,
        |s| s,
    )
    .await
}
