use crate::{Aggregate, BundlioError, Contract, PieceLink, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Outcome of offering an aggregate to the marketplace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum OfferDecision {
    Accept,
    Reject { reason: String },
}

/// Request/response boundary to the storage marketplace.
#[async_trait]
pub trait Marketplace: Send + Sync {
    async fn offer(&self, aggregate: &Aggregate, pieces: &[PieceLink]) -> Result<OfferDecision>;

    async fn query(&self, piece: &str) -> Result<Vec<Contract>>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OfferBody<'a> {
    issuer: &'a str,
    audience: &'a str,
    aggregate: &'a PieceLink,
    buffer: &'a str,
    storefront: &'a str,
    group: &'a str,
    pieces: &'a [PieceLink],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody<'a> {
    issuer: &'a str,
    audience: &'a str,
    piece: &'a str,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    contracts: Vec<Contract>,
}

/// Marketplace reached over JSON HTTP with the issuer/audience principals
/// carried in every request body.
#[derive(Clone)]
pub struct HttpMarketplace {
    client: reqwest::Client,
    endpoint: String,
    issuer: String,
    audience: String,
}

impl HttpMarketplace {
    pub fn new(
        endpoint: impl Into<String>,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    async fn post<B: Serialize + Sync, R: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}/{}", self.endpoint, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| BundlioError::Marketplace(format!("POST {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(BundlioError::Marketplace(format!(
                "POST {} returned status {}",
                url,
                response.status()
            )));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| BundlioError::Marketplace(format!("invalid response from {}: {}", url, e)))
    }
}

#[async_trait]
impl Marketplace for HttpMarketplace {
    async fn offer(&self, aggregate: &Aggregate, pieces: &[PieceLink]) -> Result<OfferDecision> {
        let body = OfferBody {
            issuer: &self.issuer,
            audience: &self.audience,
            aggregate: &aggregate.piece,
            buffer: aggregate.buffer.as_str(),
            storefront: &aggregate.storefront,
            group: &aggregate.group,
            pieces,
        };
        self.post("aggregate/offer", &body).await
    }

    async fn query(&self, piece: &str) -> Result<Vec<Contract>> {
        let body = QueryBody {
            issuer: &self.issuer,
            audience: &self.audience,
            piece,
        };
        let response: QueryResponse = self.post("deal/info", &body).await?;
        Ok(response.contracts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_wire_shape() {
        let accept: OfferDecision = serde_json::from_str(r#"{"decision":"accept"}"#).unwrap();
        assert_eq!(accept, OfferDecision::Accept);

        let reject: OfferDecision =
            serde_json::from_str(r#"{"decision":"reject","reason":"invalid piece"}"#).unwrap();
        assert_eq!(
            reject,
            OfferDecision::Reject {
                reason: "invalid piece".to_string()
            }
        );

        assert!(serde_json::from_str::<OfferDecision>(r#"{"decision":"maybe"}"#).is_err());
    }

    #[test]
    fn test_endpoint_trailing_slash_is_trimmed() {
        let marketplace = HttpMarketplace::new("https://deals.example/", "did:web:a", "did:web:b");
        assert_eq!(marketplace.endpoint, "https://deals.example");
    }
}
