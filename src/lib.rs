//! # dispatcher-core
//!
//! The engine behind a chat-triggered autonomous coding-agent dispatcher.
//! Human users (via chat platforms) or external systems (HTTP webhooks,
//! comment pollers, scheduled timers) submit natural-language requests;
//! this crate classifies each request, resolves it to a repository,
//! enqueues a durable task, and hands it to an external coding-agent
//! subprocess running inside an isolated per-task working copy.
//!
//! ## Scope
//!
//! This crate is the core engine only: router, repo resolver, durable
//! task queue, worker pool, workspace manager, session store, schedule
//! store + cron evaluator, trace store, and repo registry. Concrete chat
//! adapters (Slack, Discord, Telegram, WhatsApp, a terminal REPL) and
//! concrete coding-agent CLIs are external collaborators; this crate
//! defines the interfaces they implement ([`adapters`], [`runner`]) and
//! ships two concrete runner integrations (`claude-code`, `codex`)
//! alongside the one HTTP surface precise enough to live in the core:
//! the GitHub webhook endpoint in [`api`].
//!
//! It is single-node: one process, one local SQLite database, one local
//! working-tree area. It does not itself edit code, run tests, or talk
//! to hosting APIs — it orchestrates an agent that does.

/// Interfaces the core consumes from chat/event transports.
pub mod adapters;
/// The GitHub webhook HTTP surface and diagnostic endpoints.
pub mod api;
/// Static configuration plus persisted user/repo edits.
pub mod config;
/// System-wide tunables.
pub mod constants;
/// Cron expression matching and the per-minute fired-set.
pub mod cron;
/// Shared SQLite access helpers.
pub mod db;
/// Crate-wide error type.
pub mod error;
/// Command dispatch for chat messages and out-of-chat events.
pub mod handlers;
/// Core data model shared across the stores.
pub mod models;
/// Durable priority/FIFO task queue.
pub mod queue;
/// Canonical repository metadata and the external-sync loop.
pub mod registry;
/// Reply chunking and the debounced status updater.
pub mod reply;
/// Repository resolution (hint / authz / single-repo / LLM fallback).
pub mod resolver;
/// Pure intent classification.
pub mod router;
/// Coding-agent subprocess integration.
pub mod runner;
/// User-created recurring triggers.
pub mod schedule;
/// Per-user conversation history and mode.
pub mod session;
/// Append-only per-task structured event log.
pub mod trace;
/// The bounded-concurrency dispatch loop.
pub mod worker;
/// Git plumbing for cloning repos and per-task worktrees.
pub mod workspace;

pub use error::{DispatchError, Result};
