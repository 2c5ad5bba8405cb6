use crate::errors::ApiError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Pix,
    Card,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Pix => "PIX",
            PaymentMethod::Card => "CARD",
        }
    }
}

/// Lifecycle shared by orders and their payments.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Approved,
    Declined,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Approved => "APPROVED",
            PaymentStatus::Declined => "DECLINED",
            PaymentStatus::Expired => "EXPIRED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Customer {
    pub name: String,
    pub email: String,
    pub cpf: String,
    pub phone: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price_cents: i64,
    pub seller: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub product_id: String,
    pub amount_cents: i64,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub customer: Customer,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub order_id: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(skip_serializing)]
    pub qr_base64: Option<String>,
    #[serde(skip_serializing)]
    pub copy_paste: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PixCreateRequest {
    pub product_id: String,
    pub customer: Customer,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CardPaymentRequest {
    pub product_id: String,
    pub customer: Customer,
    pub token: String,
    pub last4: String,
    pub brand: String,
    pub exp: String,
    pub holder: String,
    pub jti: String,
    pub iat: i64,
    /// Token expiry, epoch milliseconds.
    pub exp_at: i64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PixWebhookRequest {
    pub txid: String,
    pub status: String,
}

/// Deserializes and validates a JSON body, collecting every issue found.
pub trait Validate: DeserializeOwned {
    fn issues(&self) -> Vec<String>;

    fn from_json(body: &Value) -> Result<Self, ApiError> {
        let parsed: Self = serde_json::from_value(body.clone())
            .map_err(|err| ApiError::validation(vec![format!("body: {err}")]))?;
        let issues = parsed.issues();
        if issues.is_empty() {
            Ok(parsed)
        } else {
            Err(ApiError::validation(issues))
        }
    }
}

impl Validate for PixCreateRequest {
    fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        require_min_len(&mut issues, "productId", &self.product_id, 1);
        customer_issues(&mut issues, &self.customer);
        issues
    }
}

impl Validate for CardPaymentRequest {
    fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        require_min_len(&mut issues, "productId", &self.product_id, 1);
        customer_issues(&mut issues, &self.customer);
        require_min_len(&mut issues, "token", &self.token, 10);
        if self.last4.chars().count() != 4 {
            issues.push("last4: must be exactly 4 characters".to_string());
        }
        require_min_len(&mut issues, "brand", &self.brand, 3);
        require_min_len(&mut issues, "exp", &self.exp, 4);
        require_min_len(&mut issues, "holder", &self.holder, 2);
        require_min_len(&mut issues, "jti", &self.jti, 8);
        issues
    }
}

impl Validate for PixWebhookRequest {
    fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        require_min_len(&mut issues, "txid", &self.txid, 8);
        if self.target_status().is_none() {
            issues.push("status: must be APPROVED or EXPIRED".to_string());
        }
        issues
    }
}

impl PixWebhookRequest {
    pub fn target_status(&self) -> Option<PaymentStatus> {
        match self.status.as_str() {
            "APPROVED" => Some(PaymentStatus::Approved),
            "EXPIRED" => Some(PaymentStatus::Expired),
            _ => None,
        }
    }
}

fn require_min_len(issues: &mut Vec<String>, field: &str, value: &str, min: usize) {
    if value.chars().count() < min {
        issues.push(format!("{field}: must have at least {min} characters"));
    }
}

fn customer_issues(issues: &mut Vec<String>, customer: &Customer) {
    require_min_len(issues, "customer.name", &customer.name, 2);
    if !is_email(&customer.email) {
        issues.push("customer.email: invalid email address".to_string());
    }
    if !is_digits(&customer.cpf, 11, 11) {
        issues.push("customer.cpf: must have 11 digits".to_string());
    }
    if !is_digits(&customer.phone, 10, 11) {
        issues.push("customer.phone: must have 10 or 11 digits".to_string());
    }
}

pub fn is_digits(value: &str, min: usize, max: usize) -> bool {
    (min..=max).contains(&value.len()) && value.chars().all(|c| c.is_ascii_digit())
}

fn is_email(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.split('.').count() >= 2
        && domain.split('.').all(|part| !part.is_empty())
}
