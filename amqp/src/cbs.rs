//! Claims-based security: putting tokens to the `$cbs` node.
//!
//! A [`Cbs`] owns a [`ManagementClient`] for `$cbs`. Each instance has its own
//! link pair and reply address, so several may run on one session.

use crate::auth::TokenProvider;
use crate::common::Context;
use crate::management::{
    ManagementClient, ManagementClientOptions, ManagementOpenStatus, ManagementOperationStatus,
};
use crate::models::AmqpMessage;
use crate::session::Session;
use crate::{AmqpError, AmqpResult};
use std::fmt;

pub const CBS_NODE: &str = "$cbs";
pub const CBS_STATUS_CODE_KEY: &str = "status-code";
pub const CBS_STATUS_DESCRIPTION_KEY: &str = "status-description";
pub const PUT_TOKEN_OPERATION: &str = "put-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CbsTokenType {
    Sas,
    Jwt,
}

impl CbsTokenType {
    /// Value of the request's `type` property.
    pub fn as_str(&self) -> &'static str {
        match self {
            CbsTokenType::Sas => "servicebus.windows.net:sastoken",
            CbsTokenType::Jwt => "jwt",
        }
    }
}

impl fmt::Display for CbsTokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbsOpenResult {
    Invalid,
    Ok,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbsOperationResult {
    Invalid,
    Ok,
    Error,
    Failed,
    InstanceClosed,
}

impl From<ManagementOperationStatus> for CbsOperationResult {
    fn from(status: ManagementOperationStatus) -> Self {
        match status {
            ManagementOperationStatus::Invalid => CbsOperationResult::Invalid,
            ManagementOperationStatus::Ok => CbsOperationResult::Ok,
            ManagementOperationStatus::Error => CbsOperationResult::Error,
            ManagementOperationStatus::FailedBadStatus => CbsOperationResult::Failed,
            ManagementOperationStatus::InstanceClosed => CbsOperationResult::InstanceClosed,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CbsOptions {
    pub enable_trace: bool,
}

pub struct Cbs {
    management: ManagementClient,
}

impl fmt::Debug for Cbs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cbs")
            .field("management", &self.management)
            .finish()
    }
}

impl Cbs {
    pub fn new(session: &Session, options: CbsOptions) -> AmqpResult<Self> {
        let management = ManagementClient::new(
            session,
            CBS_NODE,
            ManagementClientOptions {
                status_code_key: CBS_STATUS_CODE_KEY.to_string(),
                status_description_key: CBS_STATUS_DESCRIPTION_KEY.to_string(),
                enable_trace: options.enable_trace,
            },
        )?;
        Ok(Self { management })
    }

    /// Attaches the link pair to `$cbs`.
    ///
    /// Any failure to reach the node, including a connection with nothing
    /// listening, is reported as [`CbsOpenResult::Error`].
    pub async fn open(&self, ctx: &Context) -> CbsOpenResult {
        match self.management.open(ctx).await {
            ManagementOpenStatus::Ok => CbsOpenResult::Ok,
            ManagementOpenStatus::Cancelled => CbsOpenResult::Cancelled,
            ManagementOpenStatus::Error => CbsOpenResult::Error,
            ManagementOpenStatus::Invalid => CbsOpenResult::Invalid,
        }
    }

    /// Puts `token` for `audience` and returns the result with the response's
    /// status code and description.
    ///
    /// # Errors
    ///
    /// Returns a cancellation error if `ctx` ends before the response, and
    /// transport errors that stop the request from being sent.
    pub async fn put_token(
        &self,
        token_type: CbsTokenType,
        audience: &str,
        token: &str,
        ctx: &Context,
    ) -> AmqpResult<(CbsOperationResult, u32, String)> {
        let request = AmqpMessage::with_value(token).set_application_property("name", audience);
        let result = self
            .management
            .execute_operation(PUT_TOKEN_OPERATION, token_type.as_str(), "", request, ctx)
            .await?;
        let result_code = CbsOperationResult::from(result.status);
        if result_code != CbsOperationResult::Ok {
            log::warn!(
                "put-token for '{audience}' returned {result_code:?} ({}): {}",
                result.status_code,
                result.description
            );
        }
        Ok((result_code, result.status_code, result.description))
    }

    pub async fn close(&self, ctx: &Context) -> AmqpResult<()> {
        self.management.close(ctx).await
    }
}

/// Puts a token from `credential` for `entity`, then closes the `$cbs` links.
pub(crate) async fn authenticate(
    session: &Session,
    credential: &dyn TokenProvider,
    entity: &str,
    trace: bool,
    ctx: &Context,
) -> AmqpResult<()> {
    let audience = credential.audience(entity);
    let token = credential.get_token(&audience).await?;

    let cbs = Cbs::new(session, CbsOptions { enable_trace: trace })?;
    match Box::pin(cbs.open(ctx)).await {
        CbsOpenResult::Ok => {}
        CbsOpenResult::Cancelled => return Err(ctx.cancellation_error("authentication")),
        other => {
            return Err(AmqpError::AuthenticationFailed(format!(
                "could not open {CBS_NODE} for '{audience}': {other:?}"
            )));
        }
    }

    let outcome = cbs
        .put_token(credential.token_type(), &audience, &token.token, ctx)
        .await;
    if let Err(e) = cbs.close(ctx).await {
        log::debug!("closing {CBS_NODE} after put-token failed: {e}");
    }

    let (result, status_code, description) = outcome?;
    if result != CbsOperationResult::Ok {
        return Err(AmqpError::AuthenticationFailed(format!(
            "put-token for '{audience}' returned {result:?} (status {status_code}): {description}"
        )));
    }
    log::info!("Authenticated '{audience}' through {CBS_NODE}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_type_names() {
        assert_eq!(CbsTokenType::Sas.as_str(), "servicebus.windows.net:sastoken");
        assert_eq!(CbsTokenType::Jwt.to_string(), "jwt");
    }

    #[test]
    fn test_operation_result_mapping() {
        assert_eq!(
            CbsOperationResult::from(ManagementOperationStatus::FailedBadStatus),
            CbsOperationResult::Failed
        );
        assert_eq!(
            CbsOperationResult::from(ManagementOperationStatus::InstanceClosed),
            CbsOperationResult::InstanceClosed
        );
    }
}
