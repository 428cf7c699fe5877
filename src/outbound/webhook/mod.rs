// Webhook delivery engine
//
// Building blocks (no I/O):
//   subscription, filter, template, payload, hmac_signer, retry_strategy, schemas
//
// Runtime components:
//   dispatcher       – matches an event, records deliveries and enqueues them
//   delivery_queue   – bounded hand-off between dispatch and the workers
//   delivery_service – worker pool sending HTTP webhooks
//   retry_scheduler  – holds failed deliveries until their retry time
//   manager          – owns the runtime and its start/stop lifecycle

pub mod delivery_queue;
pub mod delivery_service;
pub mod dispatcher;
pub mod filter;
pub mod hmac_signer;
pub mod http_client;
pub mod manager;
pub mod payload;
pub mod retry_scheduler;
pub mod retry_strategy;
pub mod schemas;
pub mod subscription;
pub mod template;

// Re-export commonly used types
pub use delivery_queue::{DeliveryQueue, OverflowPolicy};
pub use delivery_service::{DeliveryError, DeliveryService};
pub use dispatcher::{DispatchError, DispatchReport, Dispatcher};
pub use filter::{FilterError, SubscriptionFilter};
pub use hmac_signer::{HmacSigner, format_signature_header, parse_signature_header, verify_signature};
pub use http_client::{HttpClientError, WebhookHttpClient};
pub use manager::{ManagerError, WebhookManager};
pub use payload::{PayloadBuilder, delivery_id_for};
pub use retry_scheduler::RetryScheduler;
pub use retry_strategy::RetryStrategy;
pub use schemas::{Delivery, DeliveryResponse, DeliveryStatus, RenderedRequest, WebhookPayload};
pub use subscription::{RegistrationError, Subscription};
pub use template::{TemplateError, WebhookTemplate};
