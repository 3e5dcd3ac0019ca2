use std::future::Future;
use std::pin::Pin;

/// A boxed, owned future, the standard workaround for returning `async fn`
/// results from a `dyn`-safe trait. `Connection`/`Session`/`Extension` need
/// to be trait objects (a `pgwire::Server` holds exactly one, chosen at
/// construction time, without knowing its concrete backend type), and
/// `async fn` in a trait isn't object-safe, so methods that need to await
/// return this instead.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
