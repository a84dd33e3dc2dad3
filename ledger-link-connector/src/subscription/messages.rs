use super::SubscriptionController;
use crate::{
    config::MessageProperties,
    engine::{SignedMessage, Transaction},
    error::SendError,
};

/// Sends a message, rebuilding it with a longer timeout every time it expires.
///
/// `build` receives the message timeout in seconds. Once the attempt budget is spent,
/// one more message is executed locally to recover the probable exit code, which is
/// reported through [`SendError::Expired`].
pub async fn send_with_retries<F>(
    controller: &SubscriptionController,
    address: &str,
    properties: &MessageProperties,
    mut build: F,
) -> Result<Transaction, SendError>
where
    F: FnMut(u32) -> anyhow::Result<SignedMessage>,
{
    let properties = properties.validated();

    let mut timeout = f64::from(properties.timeout_secs);
    for attempt in 1..=properties.retry_count {
        let message = build(timeout as u32).map_err(SendError::Build)?;
        tracing::debug!(address, attempt, hash = %message.hash, timeout = timeout as u32, "Sending message");

        if let Some(transaction) = controller.send_message(address, &message).await? {
            return Ok(transaction);
        }

        tracing::warn!(address, attempt, hash = %message.hash, "Message expired");
        timeout *= properties.timeout_grow_factor;
    }

    let message = build(properties.timeout_secs).map_err(SendError::Build)?;
    let exit_code = match controller.send_message_locally(address, &message).await {
        Ok(transaction) => transaction.exit_code,
        Err(e) => {
            tracing::warn!(address, "Failed to execute expired message locally: {}", e);
            None
        }
    };

    Err(SendError::Expired { exit_code })
}
