//! Pipeline stages for web-page-to-PDF batch rendering.
//!
//! Each submodule implements one step. The per-page steps sit behind
//! traits so the renderer can be driven by stubs in tests and by other
//! backends in production.
//!
//! ## Data Flow
//!
//! ```text
//!                     ┌──────────── render (per page) ─────────────┐
//! input ──▶ coordinator ─▶ context ─▶ extract ─▶ compose ──┐       │
//!                     │      └▶ retrieve ─▶ rewrite ─▶ extract ─┘   │
//!                     └────────────────────────────────────────────┘
//!                                       │
//!                                       ▼
//!                                    archive
//! ```
//!
//! 1. [`input`]       — parse entry lists, filter blanks, assign ordinals
//! 2. [`coordinator`] — bounded fan-out, ordered result slots, render progress
//! 3. [`render`]      — the per-page fallback chain under one wait budget
//! 4. [`context`]     — isolated rendering contexts for direct capture
//! 5. [`retrieve`]    — intermediary fetch with retry/backoff, image loads
//! 6. [`rewrite`]     — root-relative resource links to absolute URLs
//! 7. [`extract`]     — readable text and image blocks from HTML
//! 8. [`compose`]     — PDF bytes via `lopdf` and `image`; runs in `spawn_blocking`
//! 9. [`archive`]     — zip packaging with two-phase progress

pub mod archive;
pub mod compose;
pub mod context;
pub mod coordinator;
pub mod extract;
pub mod input;
pub mod render;
pub mod retrieve;
pub mod rewrite;
