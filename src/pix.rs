use uuid::Uuid;

/// Renders a PIX copy-paste payload into an image data URL.
pub trait QrRenderer: Send + Sync {
    fn render(&self, payload: &str) -> Result<String, String>;
}

/// Embeds the payload as a text data URL; stands in for a real QR encoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextQrRenderer;

impl QrRenderer for TextQrRenderer {
    fn render(&self, payload: &str) -> Result<String, String> {
        if payload.is_empty() {
            return Err("empty PIX payload".to_string());
        }
        Ok(format!("data:text/plain;charset=utf-8,{payload}"))
    }
}

/// 25 hex characters drawn from a random UUID.
pub fn new_txid() -> String {
    Uuid::new_v4().simple().to_string()[..25].to_string()
}

pub fn copy_paste_code(txid: &str, amount_cents: i64) -> String {
    format!(
        "BR.GOV.BCB.PIX|txid={txid}|amount={}.{:02}",
        amount_cents / 100,
        amount_cents % 100
    )
}
