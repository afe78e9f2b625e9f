//! Account endpoints

use rust_decimal::Decimal;
use serde::Serialize;

use crate::routes::{ok, JsonResponse};
use crate::server::AppState;
use crate::types::Result;

#[derive(Debug, Serialize)]
pub struct CreditsAvailable {
    pub user_name: String,
    pub credits: Decimal,
}

pub async fn credits_available(state: &AppState, account: &str) -> Result<JsonResponse> {
    let credits = state.ledger.balance(account).await?;
    Ok(ok(CreditsAvailable {
        user_name: account.to_string(),
        credits,
    }))
}

#[cfg(test)]
mod tests {
    use crate::routes::route;
    use crate::routes::testing::*;
    use hyper::{Method, StatusCode};

    #[tokio::test]
    async fn test_credits_available() {
        let fx = fixture(42).await;
        let response = route(
            &fx.state,
            fx.request(Method::GET, "/api/v2/account/credits/available", serde_json::json!({})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["response"]["credits"], "42");
        assert_eq!(body["response"]["user_name"], "alice");
    }
}
