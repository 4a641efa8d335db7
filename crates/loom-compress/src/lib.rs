//! # loom-compress
//!
//! Fits rendered Loom content into a size budget.
//!
//! Input is a list of [`RenderElement`]s: projected object state, local
//! conversations, and bundles fetched for remote connection spans. The
//! [`CompressionEngine`] shrinks them level by level until the assembly fits,
//! honoring [`CompressionHint`](loom_types::CompressionHint)s:
//!
//! ```
//! use loom_compress::{CompressionEngine, CompressionRequest, ElementKind, RenderElement};
//!
//! let engine = CompressionEngine::default();
//! let notes = vec![RenderElement::text("intro", ElementKind::Note, "hello", 0)];
//! let assembly = engine.compress(notes, &CompressionRequest::new(1024));
//! assert!(assembly.warning.is_none());
//! ```
//!
//! Conversation bodies are split into threads and exchanges first, so a cut
//! never separates a response from its request.

pub mod config;
pub mod element;
pub mod engine;
pub mod relevance;
pub mod summary;
pub mod thread;
pub mod tier;

pub use config::CompressionConfig;
pub use element::{
    ConversationMessage, ElementBody, ElementKind, JsonRenderer, Render, RenderElement, RenderOptions,
    RendererRegistry, SpanBacking,
};
pub use engine::{
    BudgetWarning, CompressedAssembly, CompressedElement, CompressionEngine, CompressionLevel, CompressionRequest,
    DEFAULT_IMPORTANCE,
};
pub use thread::{Exchange, Thread, split_threads};
pub use tier::{BundlePart, ThreadMode, Tier, compress_conversation};
