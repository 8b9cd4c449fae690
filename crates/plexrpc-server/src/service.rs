//! Service method tables.
//!
//! A [`Service`] maps method names to type-erased invokers. Registration is
//! explicit and typed: each method is an async function from a deserializable
//! argument type to a serializable reply type, and the table erases both ends
//! behind the connection codec. Dispatch decodes the argument bytes, awaits
//! the handler and encodes the reply, so a remote invocation observes exactly
//! what an in-process call of the handler would produce.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use plexrpc_common::{CodecKind, Result, RpcError};

type InvokeFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>>;
type BoxedHandler = Box<dyn Fn(CodecKind, Vec<u8>) -> InvokeFuture + Send + Sync>;

/// Metadata and invoker for one remotely-callable method.
pub struct Method {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    handler: BoxedHandler,
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish_non_exhaustive()
    }
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared argument type of the handler.
    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    /// Declared reply type of the handler.
    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Invokes the method on already-encoded arguments.
    ///
    /// The returned future owns everything it needs, so it can run on its own
    /// task. Argument decode failures, handler errors and reply encode
    /// failures all surface as the call's error.
    pub fn invoke(&self, codec: CodecKind, args: Vec<u8>) -> InvokeFuture {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(codec, args)
    }
}

/// A named collection of methods, registered with a [`Server`](crate::Server).
///
/// # Example
///
/// ```
/// use plexrpc_server::Service;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize)]
/// struct SumArgs {
///     num1: i64,
///     num2: i64,
/// }
///
/// let service = Service::build("Arith")
///     .unwrap()
///     .method("Sum", |args: SumArgs| async move { Ok(args.num1 + args.num2) });
/// assert!(service.lookup("Sum").is_some());
/// ```
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .finish()
    }
}

impl Service {
    /// Starts building a service.
    ///
    /// The name must be an exported identifier: ASCII uppercase first
    /// character, alphanumeric or `_` afterwards.
    pub fn build(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_exported_identifier(&name) {
            return Err(RpcError::InvalidServiceName(name));
        }
        Ok(Self {
            name,
            methods: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a method under `name`. A later registration under the same
    /// name replaces the earlier one.
    pub fn method<A, R, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let name = name.into();
        let handler = Arc::new(handler);
        let erased: BoxedHandler = Box::new(move |codec, body| {
            let handler = handler.clone();
            Box::pin(async move {
                let args: A = codec.decode(&body)?;
                let reply = handler(args).await?;
                codec.encode(&reply)
            })
        });
        self.methods.insert(
            name.clone(),
            Arc::new(Method {
                name,
                arg_type: std::any::type_name::<A>(),
                reply_type: std::any::type_name::<R>(),
                num_calls: AtomicU64::new(0),
                handler: erased,
            }),
        );
        self
    }

    /// Looks up a method by bare name.
    pub fn lookup(&self, method: &str) -> Option<Arc<Method>> {
        self.methods.get(method).cloned()
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }
}

fn is_exported_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Serialize)]
    struct SumArgs {
        num1: i64,
        num2: i64,
    }

    fn arith() -> Service {
        Service::build("Arith")
            .unwrap()
            .method("Sum", |args: SumArgs| async move { Ok(args.num1 + args.num2) })
    }

    #[test]
    fn test_build_validates_name() {
        assert!(Service::build("Arith").is_ok());
        assert!(Service::build("Arith2").is_ok());

        for bad in ["arith", "", "2Arith", "Arith.Sum", "_Arith"] {
            let err = Service::build(bad).unwrap_err();
            assert!(matches!(err, RpcError::InvalidServiceName(_)), "{}", bad);
            assert!(err.to_string().contains("is not a valid service name"));
        }
    }

    #[test]
    fn test_lookup() {
        let service = arith();
        assert!(service.lookup("Sum").is_some());
        assert!(service.lookup("Nope").is_none());
    }

    #[tokio::test]
    async fn test_invoke_matches_in_process_call() {
        let service = arith();
        let method = service.lookup("Sum").unwrap();
        let codec = CodecKind::Json;

        let args = codec
            .encode(&SumArgs { num1: 3, num2: 4 })
            .unwrap();
        let reply = method.invoke(codec, args).await.unwrap();
        let sum: i64 = codec.decode(&reply).unwrap();
        assert_eq!(sum, 7);
    }

    #[tokio::test]
    async fn test_num_calls_increments() {
        let service = arith();
        let method = service.lookup("Sum").unwrap();
        assert_eq!(method.num_calls(), 0);

        for i in 0..3 {
            let args = CodecKind::Json.encode(&SumArgs { num1: i, num2: i }).unwrap();
            method.invoke(CodecKind::Json, args).await.unwrap();
        }
        assert_eq!(method.num_calls(), 3);
    }

    #[tokio::test]
    async fn test_invoke_bad_args_fails() {
        let service = arith();
        let method = service.lookup("Sum").unwrap();

        let result = method.invoke(CodecKind::Json, b"not json".to_vec()).await;
        assert!(result.is_err());
        assert_eq!(method.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let service = Service::build("Failing")
            .unwrap()
            .method("Boom", |_: SumArgs| async move {
                Err::<i64, _>(RpcError::Remote("boom".to_string()))
            });
        let method = service.lookup("Boom").unwrap();
        let args = CodecKind::Json.encode(&SumArgs { num1: 0, num2: 0 }).unwrap();

        let err = method.invoke(CodecKind::Json, args).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_type_names_recorded() {
        let service = arith();
        let method = service.lookup("Sum").unwrap();
        assert!(method.arg_type().contains("SumArgs"));
        assert!(method.reply_type().contains("i64"));
    }
}
