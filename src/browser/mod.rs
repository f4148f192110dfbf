pub mod backend;
pub mod context;
pub mod fingerprint;
pub mod webdriver;

// Re-export common types
pub use backend::{Browser, BrowserBackend, NavigationResponse, PageSession, PageSnapshot};
pub use context::{BrowserContextManager, ContextLease};
pub use fingerprint::{Fingerprint, FingerprintGenerator, Viewport};
pub use webdriver::WebDriverBackend;
