#[macro_use]
pub mod params;

pub mod cache;
pub mod config;
pub mod error;
pub mod generator;
pub mod options;
pub mod page;
pub mod paraminfo;
pub mod request;
pub mod site;
pub mod transport;

pub use cache::{CacheEntry, CacheStats, CacheStore, CachedRequest};
pub use config::{ClientConfig, load_config};
pub use error::{ApiErrorKind, Error, Result};
pub use generator::{GeneratorState, ListGenerator, PageGenerator, PropertyGenerator, QueryGenerator};
pub use options::OptionSet;
pub use page::{NamespaceId, PageKey, PageRef, PageResult};
pub use paraminfo::{ModuleInfo, ParamInfo, ParameterInfo};
pub use params::{ParamValue, Params};
pub use request::{QueryFetch, Request, RetryPolicy};
pub use site::Site;
pub use transport::{HttpTransport, Method, Transport};
