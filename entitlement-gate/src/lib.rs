//! Entitlement Gate: Billing-Backed Access Control for AI Assistants
//!
//! A Rust library that decides whether an authenticated user may use a paid
//! AI assistant, and keeps that decision correct while an unreliable payment
//! gateway delivers billing events at least once and in no particular order.
//!
//! # What is the Entitlement Gate?
//!
//! Paid assistant features are gated on billing state that this crate does
//! not control: the payment gateway is the source of truth for money, and it
//! reports changes through webhooks that can arrive late, repeated, and out
//! of order. The gate turns that stream into a locally consistent answer:
//!
//! - **Monotonic lifecycle**: state transitions follow a strict machine and
//!   a per-record event watermark, so replays and stragglers can never
//!   regress a record.
//! - **Idempotent reconciliation**: handling the same delivery twice writes
//!   nothing the second time.
//! - **Atomic cascades**: a package and its child subscriptions move
//!   together or not at all.
//! - **Layered access**: individual subscriptions, package seats, and
//!   institutional licenses are resolved in one read.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ Payment Gateway  │  at-least-once, unordered webhooks
//! └────────┬─────────┘
//!          │ POST /webhooks/payment-gateway
//! ┌────────▼─────────────────────────────────────────┐
//! │           Entitlement Gate (this crate)          │
//! │  ┌───────────┐  ┌──────────┐  ┌──────────────┐  │
//! │  │ gateway:: │──│identity::│──│ lifecycle::  │  │
//! │  │ normalize │  │ resolve  │  │ plan + apply │  │
//! │  └───────────┘  └──────────┘  └──────┬───────┘  │
//! │                                      │ CAS       │
//! │  ┌───────────┐              ┌────────▼───────┐  │
//! │  │ access::  │◄─────────────│    store::     │  │
//! │  │ has_access│   one read   │  versioned     │  │
//! │  └───────────┘              │  records       │  │
//! └──────────────────────────────└────────────────┘──┘
//! ```
//!
//! # Quick Start
//!
//! ## 1. Reconcile a Webhook Delivery
//!
//! ```rust
//! use chrono::Utc;
//! use entitlement_gate::{
//!     reconciler::Reconciler,
//!     store::MemoryStore,
//! };
//!
//! # async fn example() -> entitlement_gate::error::Result<()> {
//! let reconciler = Reconciler::new(MemoryStore::new());
//!
//! let body = r#"{
//!     "event": "PAYMENT_RECEIVED",
//!     "dateCreated": "2026-03-01T10:00:00Z",
//!     "payment": { "id": "pay_1", "subscription": "gwsub_9", "value": 39.90 }
//! }"#;
//!
//! let ack = reconciler.handle_json(body, Utc::now()).await?;
//! println!("delivery {} -> {}", ack.request_id, ack.outcome);
//! # Ok(())
//! # }
//! ```
//!
//! ## 2. Check Access
//!
//! ```rust
//! use chrono::Utc;
//! use entitlement_gate::{
//!     access::AccessEngine,
//!     model::{AssistantId, PrincipalId},
//!     store::MemoryStore,
//! };
//!
//! # fn example() -> entitlement_gate::error::Result<()> {
//! let engine = AccessEngine::new(MemoryStore::new());
//!
//! let principal = PrincipalId::new("8f14e45f-ceea-4a7b-9c2e-27f1a3b4c5d6")?;
//! let assistant = AssistantId::new("essay-coach")?;
//!
//! let decision = engine.has_access(&principal, &assistant, Utc::now())?;
//! if decision.granted {
//!     println!("granted via {:?}", decision.via);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## 3. Create Records at Checkout
//!
//! ```rust
//! use chrono::Utc;
//! use entitlement_gate::{
//!     enrollment::{self, NewSubscription, PaymentMethod},
//!     model::{AssistantId, Cadence, PrincipalId},
//!     pricing::StaticPriceTable,
//!     store::MemoryStore,
//! };
//!
//! # fn example() -> entitlement_gate::error::Result<()> {
//! let store = MemoryStore::new();
//! let prices = StaticPriceTable::default();
//!
//! let subscription = enrollment::create_subscription(
//!     &store,
//!     &prices,
//!     NewSubscription {
//!         principal_id: PrincipalId::new("8f14e45f-ceea-4a7b-9c2e-27f1a3b4c5d6")?,
//!         assistant_id: AssistantId::new("essay-coach")?,
//!         cadence: Cadence::Monthly,
//!         payment_method: PaymentMethod::Pix,
//!         gateway_subscription_id: None,
//!         gateway_customer_id: None,
//!     },
//!     Utc::now(),
//! )?;
//!
//! // PIX settles asynchronously; the record waits for the gateway.
//! assert_eq!(subscription.status, entitlement_gate::model::EntitlementStatus::Pending);
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`model`]: persisted records, identifiers, statuses, cadences
//! - [`gateway`]: webhook wire format and event normalization
//! - [`identity`]: event-to-record resolution fallback chain
//! - [`lifecycle`]: the pure transition planner and expiry rules
//! - [`reconciler`]: the delivery pipeline tying the above together
//! - [`store`]: versioned record store trait and in-memory implementation
//! - [`access`]: read-only entitlement checks
//! - [`enrollment`]: checkout-side record creation and user cancel
//! - [`pricing`]: price table for checkout amounts
//! - [`retry`]: bounded backoff for conditional-write races
//! - [`audit`]: correlation-id audit logging
//! - [`error`]: error types and the crate-wide [`Result`](error::Result)
//!
//! # Delivery Guarantees
//!
//! The gateway treats any 2xx as delivered and anything else as retry-later,
//! so the crate acknowledges everything it can classify: unknown event
//! types, events matching no local record, stale replays, and even write
//! races that exhaust their retries (those are flagged for manual
//! reconciliation in the audit log). Only a structurally malformed body is
//! an error, surfaced as a 400 that the gateway will not retry.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod access;
pub mod audit;
pub mod enrollment;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod lifecycle;
pub mod model;
pub mod pricing;
pub mod reconciler;
pub mod retry;
pub mod store;

pub use error::{GateError, Result};
pub use reconciler::{Ack, ReconcileOutcome, Reconciler};
pub use store::{MemoryStore, Store};
