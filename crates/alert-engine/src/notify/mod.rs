//! Notification channels and dispatch
//!
//! Channels implement [`Deliver`]; the [`NotificationDispatcher`] drives
//! escalation steps, retries, rate limits and duplicate suppression.

mod channel;
mod dispatcher;
mod rate_limit;

pub use channel::{
    build_channel, ChannelConfig, ChannelError, ChannelKind, ChannelSpec, ChatChannel,
    ChatMessage, Deliver, EmailChannel, Notification, NotificationKind, RateLimit, WebhookChannel,
    WebhookPayload,
};
pub use dispatcher::{
    DeliveryOutcome, DeliveryRecord, DispatcherConfig, EscalationPolicy, EscalationStep,
    NotificationDispatcher, RetryPolicy,
};
pub use rate_limit::TokenBucket;
