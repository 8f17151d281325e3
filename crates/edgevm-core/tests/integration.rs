//! Integration tests for edgevm-core.
//!
//! These tests drive WAT modules through the full pipeline:
//! - Service and instance creation
//! - Runtime with the builtin `env` module
//! - Recursive module resolution and memoization
//! - The `_start` / `_ready` handshake
//! - Function calls, reflection and cancellation
//! - Plugin attachment and output capture

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use edgevm_common::{
    DefinitionKind, ExecutionConfig, HostFunctionError, InvocationError, OutputMode,
    RuntimeConfig, RuntimeError,
};
use edgevm_core::{
    BackendLoader, ExecutionContext, GlobalDefinition, HostFunctionDefinition,
    HostModuleDefinitions, MemoryBackend, MemoryDefinition, ParamKind, Plugin, ResolvingSource,
    Runtime, Service, Source, SourceModule, StaticResolver, Value, ValueType,
};
use edgevm_host::codec::{self, errno_values};
use edgevm_host::{Errno, Factory, FactoryPlugin, HandleArena};

// ============================================================================
// Harness
// ============================================================================

/// In-memory WAT source that counts how often each name is fetched.
#[derive(Debug, Default)]
struct CountingSource {
    modules: HashMap<String, String>,
    loads: Mutex<HashMap<String, usize>>,
}

impl CountingSource {
    fn new(modules: &[(&str, &str)]) -> Self {
        Self {
            modules: modules
                .iter()
                .map(|(name, wat)| ((*name).to_string(), (*wat).to_string()))
                .collect(),
            loads: Mutex::default(),
        }
    }

    fn loads(&self, name: &str) -> usize {
        self.loads.lock().get(name).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Source for CountingSource {
    async fn module(
        &self,
        _ctx: &ExecutionContext,
        name: &str,
    ) -> Result<SourceModule, RuntimeError> {
        *self.loads.lock().entry(name.to_string()).or_default() += 1;
        let wat = self
            .modules
            .get(name)
            .ok_or_else(|| RuntimeError::module_not_found(name))?;
        Ok(SourceModule::new(name, None, wat.clone().into_bytes()))
    }
}

fn context() -> ExecutionContext {
    ExecutionContext::builder()
        .project("proj")
        .application("app")
        .resource("res")
        .build()
}

async fn runtime_with(
    modules: &[(&str, &str)],
    config: ExecutionConfig,
    definitions: Option<HostModuleDefinitions>,
) -> Result<(Runtime, Arc<CountingSource>), RuntimeError> {
    let source = Arc::new(CountingSource::new(modules));
    let service = Service::from_config(&RuntimeConfig::default(), source.clone())?;
    let instance = service.instance(context(), config)?;
    let runtime = instance.runtime(definitions).await?;
    Ok((runtime, source))
}

async fn runtime(modules: &[(&str, &str)]) -> (Runtime, Arc<CountingSource>) {
    runtime_with(modules, ExecutionConfig::default(), None)
        .await
        .unwrap()
}

// ============================================================================
// Test: Builtins
// ============================================================================

#[tokio::test]
async fn test_builtins_present() {
    let wat = r#"
        (module
            (import "env" "_ready" (func $ready))
            (import "env" "_sleep" (func $sleep (param i64)))
            (import "env" "_log" (func $log (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 0) "hello from guest")
            (func (export "run") (result i32)
                (call $log (i32.const 0) (i32.const 16))
                (call $sleep (i64.const 1000))
                (i32.const 42)
            )
        )
    "#;
    let (runtime, _) = runtime(&[("main", wat)]).await;

    let module = runtime.module("main").await.unwrap();
    let ret = module.function("run").await.unwrap().call(&[]).await.unwrap();

    let mut out = 0u32;
    ret.reflect(&mut [&mut out]).unwrap();
    assert_eq!(out, 42);
}

#[tokio::test]
async fn test_log_out_of_range_is_not_fatal() {
    let wat = r#"
        (module
            (import "env" "_log" (func $log (param i32 i32)))
            (memory (export "memory") 1)
            (func (export "run") (result i32)
                (call $log (i32.const 65530) (i32.const 100))
                (i32.const 1)
            )
        )
    "#;
    let (runtime, _) = runtime(&[("main", wat)]).await;

    let module = runtime.module("main").await.unwrap();
    let ret = module.function("run").await.unwrap().call(&[]).await.unwrap();
    assert!(ret.error().is_none());
}

// ============================================================================
// Test: Host module definitions
// ============================================================================

fn noop(name: &str) -> HostFunctionDefinition {
    HostFunctionDefinition::new(name, [], [], |_| Ok(vec![]))
}

#[tokio::test]
async fn test_duplicate_env_definition() {
    let definitions = HostModuleDefinitions {
        functions: vec![noop("foo"), noop("foo")],
        ..Default::default()
    };

    let err = runtime_with(&[], ExecutionConfig::default(), Some(definitions))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::AlreadyDefined { kind: DefinitionKind::Function, .. }
    ));
    assert_eq!(err.to_string(), "function `foo` already defined in module `env`");
}

#[tokio::test]
async fn test_builtin_name_collision() {
    let definitions = HostModuleDefinitions {
        functions: vec![noop("_ready")],
        ..Default::default()
    };

    let err = runtime_with(&[], ExecutionConfig::default(), Some(definitions))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "function `_ready` already defined in module `env`");
}

#[tokio::test]
async fn test_duplicate_leaves_module_usable() {
    let wat = r#"
        (module
            (import "lib" "foo" (func $foo (result i32)))
            (import "lib" "bar" (func $bar (result i32)))
            (func (export "sum") (result i32)
                (i32.add (call $foo) (call $bar))
            )
        )
    "#;
    let (runtime, _) = runtime(&[("main", wat)]).await;

    let constant = |name: &str, value: i32| {
        HostFunctionDefinition::new(name, [], [ValueType::I32], move |_| {
            Ok(vec![Value::I32(value)])
        })
    };

    let mut lib = runtime.expose("lib").unwrap();
    lib.functions([constant("foo", 1)]).unwrap();

    let err = lib.functions([constant("bar", 2), constant("foo", 3)]).unwrap_err();
    assert!(err.to_string().contains("`foo`"));
    assert!(err.to_string().contains("`lib`"));
    // The failed batch inserted nothing
    assert!(!lib.contains("bar"));

    lib.functions([constant("bar", 2)]).unwrap();
    lib.compile().await.unwrap();

    let module = runtime.module("main").await.unwrap();
    let ret = module.function("sum").await.unwrap().call(&[]).await.unwrap();
    assert_eq!(ret.values().unwrap(), vec![Value::I32(3)]);
}

#[tokio::test]
async fn test_invalid_host_signature() {
    let (runtime, _) = runtime(&[]).await;
    let mut lib = runtime.expose("lib").unwrap();

    let def = HostFunctionDefinition::new(
        "bad",
        [ValueType::I32.into(), ParamKind::Context],
        [],
        |_| Ok(vec![]),
    );
    let err = lib.functions([def]).unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidSignature { .. }));
}

#[tokio::test]
async fn test_env_memory_and_global() {
    let wat = r#"
        (module
            (import "env" "shared" (memory 1 1))
            (import "env" "answer" (global $answer i32))
            (func (export "read") (result i32)
                (i32.add (i32.load (i32.const 64)) (global.get $answer))
            )
        )
    "#;
    let definitions = HostModuleDefinitions {
        memories: vec![MemoryDefinition::new("shared", 1, Some(1))],
        globals: vec![GlobalDefinition::new("answer", 40i32)],
        ..Default::default()
    };
    let (runtime, _) = runtime_with(&[("main", wat)], ExecutionConfig::default(), Some(definitions))
        .await
        .unwrap();

    let env = runtime.module("env").await.unwrap();
    assert!(env.is_host());
    assert!(
        env.with_memory("shared", |memory| memory.write_u32_le(64, 2))
            .await
            .unwrap()
    );
    assert_eq!(env.exported_global("answer").await.unwrap(), Value::I32(40));

    let module = runtime.module("main").await.unwrap();
    let ret = module.function("read").await.unwrap().call(&[]).await.unwrap();
    assert_eq!(ret.values().unwrap(), vec![Value::I32(42)]);
}

// ============================================================================
// Test: Dependency resolution
// ============================================================================

const LIB_B: &str = r#"
    (module
        (func (export "f") (result i32) (i32.const 7))
    )
"#;

const MOD_A: &str = r#"
    (module
        (import "B" "f" (func $f (result i32)))
        (func (export "run") (result i32) (call $f))
    )
"#;

const MOD_C: &str = r#"
    (module
        (import "B" "f" (func $f (result i32)))
        (func (export "run") (result i32) (i32.mul (call $f) (i32.const 2)))
    )
"#;

#[tokio::test]
async fn test_dependency_memoization() {
    let (runtime, source) = runtime(&[("A", MOD_A), ("B", LIB_B), ("C", MOD_C)]).await;

    let a = runtime.module("A").await.unwrap();
    let c = runtime.module("C").await.unwrap();
    assert_eq!(source.loads("B"), 1);

    let b1 = runtime.module("B").await.unwrap();
    let b2 = runtime.module("B").await.unwrap();
    assert!(b1.same(&b2));
    assert_eq!(source.loads("B"), 1);
    assert_eq!(source.loads("A"), 1);

    let run_a = a.function("run").await.unwrap().call(&[]).await.unwrap();
    let run_c = c.function("run").await.unwrap().call(&[]).await.unwrap();
    assert_eq!(run_a.values().unwrap(), vec![Value::I32(7)]);
    assert_eq!(run_c.values().unwrap(), vec![Value::I32(14)]);
}

#[tokio::test]
async fn test_missing_dependency() {
    let wat = r#"
        (module
            (import "missing" "f" (func $f))
        )
    "#;
    let (runtime, _) = runtime(&[("A", wat), ("B", LIB_B)]).await;

    let err = runtime.module("A").await.unwrap_err();
    assert!(err.is_not_found());
    let message = err.to_string();
    assert!(message.contains("`A`"));
    assert!(message.contains("`missing`"));

    // Other names still load
    assert!(runtime.module("B").await.is_ok());
    assert!(runtime.module("nowhere").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_dependency_cycle() {
    let x = r#"(module (import "Y" "f" (func)) (func (export "f")))"#;
    let y = r#"(module (import "X" "f" (func)) (func (export "f")))"#;
    let (runtime, _) = runtime(&[("X", x), ("Y", y)]).await;

    let err = runtime.module("X").await.unwrap_err();

    let mut cause = &err;
    while let RuntimeError::Dependency { source, .. } = cause {
        cause = source;
    }
    assert!(matches!(cause, RuntimeError::DependencyCycle { module } if module == "X"));
}

#[tokio::test]
async fn test_invalid_module_bytes() {
    let (runtime, _) = runtime(&[("broken", "(module (func")]).await;

    let err = runtime.module("broken").await.unwrap_err();
    assert!(matches!(err, RuntimeError::CompilationFailed { .. }));
}

#[tokio::test]
async fn test_resolving_source_chain() {
    let memory = Arc::new(MemoryBackend::new());
    let uri = memory.insert("lib/b", LIB_B.as_bytes().to_vec()).unwrap();
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("B", uri);

    let source = ResolvingSource::new(resolver, Arc::new(BackendLoader::new().with(memory)));
    let service = Service::from_config(&RuntimeConfig::default(), Arc::new(source)).unwrap();
    let instance = service.instance(context(), ExecutionConfig::default()).unwrap();
    let runtime = instance.runtime(None).await.unwrap();

    let b = runtime.module("B").await.unwrap();
    let ret = b.function("f").await.unwrap().call(&[]).await.unwrap();
    assert_eq!(ret.values().unwrap(), vec![Value::I32(7)]);
}

#[tokio::test]
async fn test_closed_module_is_reloaded() {
    let (runtime, source) = runtime(&[("B", LIB_B)]).await;

    let first = runtime.module("B").await.unwrap();
    first.close().await;

    assert!(matches!(
        first.function("f").await.unwrap_err(),
        RuntimeError::Closed { .. }
    ));

    let second = runtime.module("B").await.unwrap();
    assert!(!first.same(&second));
    assert_eq!(source.loads("B"), 2);
    assert!(second.function("f").await.is_ok());
}

// ============================================================================
// Test: Start and ready handshake
// ============================================================================

#[tokio::test]
async fn test_start_runs_inline() {
    let wat = r#"
        (module
            (global $started (export "started") (mut i32) (i32.const 0))
            (func (export "_start") (global.set $started (i32.const 1)))
        )
    "#;
    let (runtime, _) = runtime(&[("main", wat)]).await;

    let module = runtime.module("main").await.unwrap();
    assert_eq!(module.exported_global("started").await.unwrap(), Value::I32(1));
}

#[tokio::test]
async fn test_ready_handshake_waits_for_signal() {
    let wat = r#"
        (module
            (import "env" "_ready" (func $ready))
            (import "env" "_sleep" (func $sleep (param i64)))
            (global $phase (export "phase") (mut i32) (i32.const 0))
            (func (export "_start")
                (call $sleep (i64.const 50000000))
                (global.set $phase (i32.const 1))
                (call $ready)
            )
        )
    "#;
    let (runtime, _) = runtime(&[("server", wat)]).await;

    let started = Instant::now();
    let module = runtime.module("server").await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(45));

    assert_eq!(module.exported_global("phase").await.unwrap(), Value::I32(1));
}

#[tokio::test]
async fn test_ready_handshake_released_by_close() {
    let wat = r#"
        (module
            (import "env" "_ready" (func $ready))
            (import "env" "_sleep" (func $sleep (param i64)))
            (func (export "_start")
                (call $sleep (i64.const 60000000000))
                (call $ready)
            )
        )
    "#;
    let (runtime, _) = runtime(&[("server", wat)]).await;

    let closer = runtime.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.close();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), runtime.module("server"))
        .await
        .expect("module() must return promptly after close");
    assert!(result.is_err());

    assert!(matches!(
        runtime.module("other").await.unwrap_err(),
        RuntimeError::Closed { .. }
    ));
    assert!(runtime.expose("late").is_err());
}

#[tokio::test]
async fn test_ready_handshake_released_by_cancellation() {
    let wat = r#"
        (module
            (import "env" "_ready" (func $ready))
            (import "env" "_sleep" (func $sleep (param i64)))
            (func (export "_start")
                (call $sleep (i64.const 60000000000))
            )
        )
    "#;
    let source = Arc::new(CountingSource::new(&[("server", wat)]));
    let service = Service::from_config(&RuntimeConfig::default(), source).unwrap();
    let ctx = context();
    let instance = service.instance(ctx.clone(), ExecutionConfig::default()).unwrap();
    let runtime = instance.runtime(None).await.unwrap();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.cancel();
    });

    let err = tokio::time::timeout(Duration::from_secs(5), runtime.module("server"))
        .await
        .expect("module() must return promptly after cancellation")
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Instantiation { .. } | RuntimeError::Closed { .. }));
}

const SERVER: &str = r#"
    (module
        (import "env" "_ready" (func $ready))
        (import "env" "_sleep" (func $sleep (param i64)))
        (global $phase (export "phase") (mut i32) (i32.const 0))
        (func (export "ping") (result i32) (i32.const 7))
        (func (export "_start")
            (global.set $phase (i32.const 1))
            (call $ready)
            (call $sleep (i64.const 60000000000))
            (global.set $phase (i32.const 2))
        )
    )
"#;

async fn within<T>(what: &str, fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .unwrap_or_else(|_| panic!("{what} did not return within 2s"))
}

#[tokio::test]
async fn test_serving_start_routine_does_not_block_lookups() {
    let (runtime, _) = runtime(&[("server", SERVER), ("B", LIB_B)]).await;
    let server = within("module(server)", runtime.module("server")).await.unwrap();

    let again = within("memoized module(server)", runtime.module("server"))
        .await
        .unwrap();
    assert!(again.same(&server));

    let ping = within("function(ping)", server.function("ping")).await.unwrap();
    assert_eq!(ping.results(), &[ValueType::I32]);

    // Anything that needs the store reports the running routine
    let ret = within("ping call", ping.call(&[])).await.unwrap();
    assert!(matches!(
        ret.error(),
        Some(InvocationError::Busy { module, .. }) if module == "server"
    ));

    let err = within("exported_global", server.exported_global("phase"))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Busy { ref module } if module == "server"));

    let err = within("module(B)", runtime.module("B")).await.unwrap_err();
    assert!(err.is_busy());

    // Closing ends the routine and every later call reports the closed runtime
    runtime.close();
    let ret = within("ping after close", ping.call(&[])).await.unwrap();
    assert!(matches!(ret.error(), Some(InvocationError::Failed { .. })));
}

#[tokio::test]
async fn test_store_released_when_start_routine_returns() {
    let wat = r#"
        (module
            (import "env" "_ready" (func $ready))
            (import "env" "_sleep" (func $sleep (param i64)))
            (global $phase (export "phase") (mut i32) (i32.const 0))
            (func (export "ping") (result i32) (i32.const 7))
            (func (export "_start")
                (call $ready)
                (call $sleep (i64.const 300000000))
                (global.set $phase (i32.const 2))
            )
        )
    "#;
    let (runtime, _) = runtime(&[("server", wat)]).await;
    let server = runtime.module("server").await.unwrap();
    let ping = server.function("ping").await.unwrap();

    let ret = ping.call(&[]).await.unwrap();
    assert!(ret.error().is_some_and(|e| matches!(e, InvocationError::Busy { .. })));

    let ret = within("ping after the routine returns", async {
        loop {
            let ret = ping.call(&[]).await.unwrap();
            if ret.error().is_none() {
                return ret;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert_eq!(ret.values().unwrap(), vec![Value::I32(7)]);
    assert_eq!(server.exported_global("phase").await.unwrap(), Value::I32(2));
}

// ============================================================================
// Test: Calls and returns
// ============================================================================

const MATH: &str = r#"
    (module
        (func (export "add") (param i32 i32) (result i32)
            (i32.add (local.get 0) (local.get 1)))
        (func (export "scale") (param f64 i64) (result f64 i64)
            (f64.mul (local.get 0) (f64.const 2))
            (i64.sub (local.get 1) (i64.const 1)))
        (func (export "neg") (result i32) (i32.const -5))
        (func (export "trap") (unreachable))
        (func (export "spin") (loop $l (br $l)))
    )
"#;

#[tokio::test]
async fn test_call_and_raw_call() {
    let (runtime, _) = runtime(&[("math", MATH)]).await;
    let math = runtime.module("math").await.unwrap();

    let add = math.function("add").await.unwrap();
    assert_eq!(add.params(), &[ValueType::I32, ValueType::I32]);
    assert_eq!(add.results(), &[ValueType::I32]);

    let ret = add.call(&[Value::I32(2), Value::I32(3)]).await.unwrap();
    assert_eq!(ret.rets(), &[5]);

    let raw = add
        .raw_call(&[edgevm_core::value::encode_i32(-10), 4])
        .await
        .unwrap();
    assert_eq!(edgevm_core::value::decode_i32(raw.rets()[0]), -6);

    let err = add.call(&[Value::I32(1)]).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ArgumentCount { expected: 2, got: 1, .. }
    ));
    assert!(add.raw_call(&[]).await.is_err());

    let scale = math.function("scale").await.unwrap();
    let ret = scale
        .call(&[Value::F64(1.25), Value::I64(i64::MIN + 1)])
        .await
        .unwrap();
    let mut doubled = 0f64;
    let mut dec = 0i64;
    ret.reflect(&mut [&mut doubled, &mut dec]).unwrap();
    assert!((doubled - 2.5).abs() < f64::EPSILON);
    assert_eq!(dec, i64::MIN);

    let neg = math.function("neg").await.unwrap().call(&[]).await.unwrap();
    let mut signed = 0i32;
    neg.reflect(&mut [&mut signed]).unwrap();
    assert_eq!(signed, -5);
    // Raw slot is zero-extended
    assert_eq!(neg.rets()[0], 0xffff_fffb);
}

#[tokio::test]
async fn test_function_not_found() {
    let (runtime, _) = runtime(&[("math", MATH)]).await;
    let math = runtime.module("math").await.unwrap();

    let err = math.function("sub").await.unwrap_err();
    assert!(matches!(err, RuntimeError::FunctionNotFound { .. }));
    assert!(err.to_string().contains("`sub`"));
    assert!(err.to_string().contains("`math`"));
}

#[tokio::test]
async fn test_reflect_errors() {
    let (runtime, _) = runtime(&[("math", MATH)]).await;
    let math = runtime.module("math").await.unwrap();
    let ret = math
        .function("add")
        .await
        .unwrap()
        .call(&[Value::I32(1), Value::I32(1)])
        .await
        .unwrap();

    let mut a = 0u32;
    let mut b = 0u32;
    assert!(matches!(
        ret.reflect(&mut [&mut a, &mut b]).unwrap_err(),
        RuntimeError::ResultCount { expected: 1, got: 2 }
    ));
    assert!(matches!(
        ret.reflect(&mut []).unwrap_err(),
        RuntimeError::ResultCount { expected: 1, got: 0 }
    ));

    let mut float = 0f32;
    assert!(matches!(
        ret.reflect(&mut [&mut float]).unwrap_err(),
        RuntimeError::ResultKind { index: 0, .. }
    ));

    let mut size = 0usize;
    ret.reflect(&mut [&mut size]).unwrap();
    assert_eq!(size, 2);
}

#[tokio::test]
async fn test_trap_is_deferred() {
    let (runtime, _) = runtime(&[("math", MATH)]).await;
    let math = runtime.module("math").await.unwrap();

    let ret = math.function("trap").await.unwrap().call(&[]).await.unwrap();
    assert!(matches!(ret.error(), Some(InvocationError::Failed { .. })));
    assert!(ret.reflect(&mut []).is_err());

    // The runtime stays usable after a trap
    let ret = math
        .function("add")
        .await
        .unwrap()
        .call(&[Value::I32(1), Value::I32(2)])
        .await
        .unwrap();
    assert!(ret.error().is_none());
}

#[tokio::test]
async fn test_cancel_in_flight_call() {
    let (runtime, _) = runtime(&[("math", MATH)]).await;
    let math = runtime.module("math").await.unwrap();
    let spin = math.function("spin").await.unwrap();

    let canceller = spin.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let ret = tokio::time::timeout(Duration::from_secs(5), spin.call(&[]))
        .await
        .expect("cancelled call must return")
        .unwrap();
    assert!(matches!(ret.error(), Some(InvocationError::Cancelled { .. })));

    // Other functions still run after the cancelled call released the store
    let add = math.function("add").await.unwrap();
    let ret = add.call(&[Value::I32(1), Value::I32(1)]).await.unwrap();
    assert_eq!(ret.rets(), &[2]);
}

#[tokio::test]
async fn test_fuel_exhaustion() {
    let config = ExecutionConfig {
        max_fuel: Some(50_000),
        ..Default::default()
    };
    let (runtime, _) = runtime_with(&[("math", MATH)], config, None).await.unwrap();
    let math = runtime.module("math").await.unwrap();

    let ret = math.function("spin").await.unwrap().call(&[]).await.unwrap();
    assert!(matches!(ret.error(), Some(InvocationError::FuelExhausted { .. })));
}

// ============================================================================
// Test: Memory
// ============================================================================

#[tokio::test]
async fn test_one_page_memory() {
    let wat = r#"
        (module
            (memory (export "memory") 1 2)
            (func (export "load") (param i32) (result i32)
                (i32.load (local.get 0)))
        )
    "#;
    let (runtime, _) = runtime(&[("mem", wat)]).await;
    let module = runtime.module("mem").await.unwrap();

    let stored = module
        .with_memory("memory", |memory| {
            assert_eq!(memory.size(), 1);
            assert!(!memory.write_u32_le(65533, 7));
            assert!(memory.write_u32_le(65532, 7));
            memory.read_u32_le(65532)
        })
        .await
        .unwrap();
    assert_eq!(stored, Some(7));

    let ret = module
        .function("load")
        .await
        .unwrap()
        .call(&[Value::I32(65532)])
        .await
        .unwrap();
    assert_eq!(ret.values().unwrap(), vec![Value::I32(7)]);

    let err = module.with_memory("other", |_| ()).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ExportNotFound { kind: DefinitionKind::Memory, .. }
    ));
}

// ============================================================================
// Test: Output capture
// ============================================================================

const HELLO: &str = r#"
    (module
        (import "wasi_snapshot_preview1" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
        (memory (export "memory") 1)
        (data (i32.const 8) "hi\n")
        (func (export "_start")
            (i32.store (i32.const 0) (i32.const 8))
            (i32.store (i32.const 4) (i32.const 3))
            (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 20)))
        )
    )
"#;

#[tokio::test]
async fn test_stdout_capture_buffer() {
    let (runtime, _) = runtime(&[("hello", HELLO)]).await;
    runtime.module("hello").await.unwrap();

    let mut out = String::new();
    runtime.stdout().unwrap().read_to_string(&mut out).unwrap();
    assert_eq!(out, "hi\n");

    let mut err = String::new();
    runtime.stderr().unwrap().read_to_string(&mut err).unwrap();
    assert!(err.is_empty());
}

#[tokio::test]
async fn test_stdout_capture_pipe() {
    let config = ExecutionConfig {
        output: OutputMode::Pipe,
        ..Default::default()
    };
    let (runtime, _) = runtime_with(&[("hello", HELLO)], config, None).await.unwrap();
    runtime.module("hello").await.unwrap();

    // Pipe readers are independent
    for _ in 0..2 {
        let mut out = String::new();
        runtime.stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "hi\n");
    }
}

// ============================================================================
// Test: Random source
// ============================================================================

const RANDOM: &str = r#"
    (module
        (import "wasi_snapshot_preview1" "random_get"
            (func $random_get (param i32 i32) (result i32)))
        (memory (export "memory") 1)
        (func (export "fill") (result i32)
            (call $random_get (i32.const 0) (i32.const 32)))
    )
"#;

async fn random_bytes(seed: Option<u64>) -> Vec<u8> {
    let config = ExecutionConfig {
        random_seed: seed,
        ..Default::default()
    };
    let (runtime, _) = runtime_with(&[("random", RANDOM)], config, None)
        .await
        .unwrap();
    let module = runtime.module("random").await.unwrap();

    let ret = module.function("fill").await.unwrap().call(&[]).await.unwrap();
    assert_eq!(ret.values().unwrap(), vec![Value::I32(0)]);

    module
        .with_memory("memory", |memory| memory.read(0, 32).map(<[u8]>::to_vec))
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_seeded_random_source_is_reproducible() {
    let first = random_bytes(Some(42)).await;
    let second = random_bytes(Some(42)).await;
    assert_eq!(first, second);
    assert!(first.iter().any(|b| *b != 0));

    assert_ne!(random_bytes(Some(43)).await, first);
}

#[tokio::test]
async fn test_unseeded_random_source_differs() {
    assert_ne!(random_bytes(None).await, random_bytes(None).await);
}

// ============================================================================
// Test: Plugins
// ============================================================================

/// Toy key-value capability: stores strings under handles.
struct StringStore {
    values: Arc<HandleArena<String>>,
    closed: Arc<Mutex<bool>>,
}

impl Factory for StringStore {
    fn name(&self) -> &str {
        "strings"
    }

    fn methods(&self) -> Vec<HostFunctionDefinition> {
        let i32_params = |n: usize| {
            std::iter::once(ParamKind::Module)
                .chain(std::iter::repeat(ParamKind::Value(ValueType::I32)).take(n))
                .collect::<Vec<_>>()
        };

        let store = Arc::clone(&self.values);
        let fetch_size = Arc::clone(&self.values);
        let fetch = Arc::clone(&self.values);

        vec![
            HostFunctionDefinition::new("W_store", i32_params(3), [ValueType::I32], move |call| {
                let (ptr, len, id_ptr) = (call.arg_u32(0)?, call.arg_u32(1)?, call.arg_u32(2)?);
                let mut module = call.module().ok_or(HostFunctionError::MissingMemory)?;
                let mut memory = module.require_memory()?;
                let result = codec::read_string(&memory, ptr, len)
                    .and_then(|value| store.insert(value))
                    .and_then(|id| codec::write_u32_le(&mut memory, id_ptr, id));
                Ok(errno_values(result))
            }),
            HostFunctionDefinition::new("W_fetchSize", i32_params(2), [ValueType::I32], move |call| {
                let (id, size_ptr) = (call.arg_u32(0)?, call.arg_u32(1)?);
                let mut module = call.module().ok_or(HostFunctionError::MissingMemory)?;
                let mut memory = module.require_memory()?;
                let result = fetch_size
                    .get(id)
                    .and_then(|value| codec::write_string_size(&mut memory, size_ptr, &value));
                Ok(errno_values(result))
            }),
            HostFunctionDefinition::new("W_fetch", i32_params(2), [ValueType::I32], move |call| {
                let (id, ptr) = (call.arg_u32(0)?, call.arg_u32(1)?);
                let mut module = call.module().ok_or(HostFunctionError::MissingMemory)?;
                let mut memory = module.require_memory()?;
                let result = fetch
                    .get(id)
                    .and_then(|value| codec::write_string(&mut memory, ptr, &value));
                Ok(errno_values(result))
            }),
            HostFunctionDefinition::new("helper", [], [], |_| Ok(vec![])),
        ]
    }

    fn close(&mut self) {
        self.values.drain();
        *self.closed.lock() = true;
    }
}

const STRINGS_GUEST: &str = r#"
    (module
        (import "sdk" "store" (func $store (param i32 i32 i32) (result i32)))
        (import "sdk" "fetchSize" (func $fetch_size (param i32 i32) (result i32)))
        (import "sdk" "fetch" (func $fetch (param i32 i32) (result i32)))
        (memory (export "memory") 1)
        (data (i32.const 0) "hello")
        (func (export "run") (result i32)
            (local $err i32)
            (local.set $err (call $store (i32.const 0) (i32.const 5) (i32.const 16)))
            (if (local.get $err) (then (return (local.get $err))))
            (local.set $err (call $fetch_size (i32.load (i32.const 16)) (i32.const 20)))
            (if (local.get $err) (then (return (local.get $err))))
            (call $fetch (i32.load (i32.const 16)) (i32.const 32))
        )
        (func (export "missing") (result i32)
            (call $fetch_size (i32.const 99) (i32.const 20))
        )
    )
"#;

#[tokio::test]
async fn test_factory_plugin_attach() {
    let (runtime, _) = runtime(&[("guest", STRINGS_GUEST)]).await;

    let values = Arc::new(HandleArena::new());
    let closed = Arc::new(Mutex::new(false));
    let plugin = {
        let values = Arc::clone(&values);
        let closed = Arc::clone(&closed);
        FactoryPlugin::new("sdk").with(move |_instance| {
            Ok(Box::new(StringStore {
                values: Arc::clone(&values),
                closed: Arc::clone(&closed),
            }) as Box<dyn Factory>)
        })
    };

    let (mut plugin_instance, sdk) = runtime.attach(&plugin).await.unwrap();
    assert_eq!(sdk.name(), "sdk");
    assert!(sdk.function("store").await.is_ok());
    assert!(matches!(
        sdk.function("helper").await.unwrap_err(),
        RuntimeError::FunctionNotFound { .. }
    ));

    let guest = runtime.module("guest").await.unwrap();
    let ret = guest.function("run").await.unwrap().call(&[]).await.unwrap();
    assert_eq!(ret.values().unwrap(), vec![Value::I32(0)]);

    let text = guest
        .with_memory("memory", |memory| {
            let len = memory.read_u32_le(20)?;
            memory.read_string(32, len)
        })
        .await
        .unwrap();
    assert_eq!(text.as_deref(), Some("hello"));
    assert_eq!(values.len(), 1);

    let ret = guest.function("missing").await.unwrap().call(&[]).await.unwrap();
    let mut code = 0u32;
    ret.reflect(&mut [&mut code]).unwrap();
    assert_eq!(Errno::from_code(code), Some(Errno::HandleNotFound));

    plugin_instance.close();
    assert!(*closed.lock());
    assert!(values.is_empty());
}

#[tokio::test]
async fn test_failing_plugin() {
    let (runtime, _) = runtime(&[]).await;
    let plugin =
        FactoryPlugin::new("broken").with(|_| Err(RuntimeError::invalid_config("no backend")));

    let Err(err) = runtime.attach(&plugin).await else {
        panic!("attaching a plugin whose factory fails must error");
    };
    assert!(matches!(err, RuntimeError::Plugin { ref plugin, .. } if plugin == "broken"));
    assert_eq!(Plugin::name(&plugin), "broken");
}

#[tokio::test]
async fn test_plugin_name_collision() {
    let (runtime, _) = runtime(&[]).await;

    let closed = Arc::new(Mutex::new(false));
    let plugin = {
        let closed = Arc::clone(&closed);
        FactoryPlugin::new("env").with(move |_instance| {
            Ok(Box::new(StringStore {
                values: Arc::new(HandleArena::new()),
                closed: Arc::clone(&closed),
            }) as Box<dyn Factory>)
        })
    };

    let Err(err) = runtime.attach(&plugin).await else {
        panic!("a plugin named after the env module must not attach");
    };
    assert!(matches!(err, RuntimeError::Instantiation { ref module, .. } if module == "env"));
    // The factories built for the failed attach are released
    assert!(*closed.lock());

    // env is untouched
    let env = runtime.module("env").await.unwrap();
    assert!(env.function("_ready").await.is_ok());
    assert!(env.function("store").await.is_err());
}
