use crate::model::{is_digits, PaymentStatus};

const MAX_TICKET_CENTS: i64 = 500_000;
const SUSPICIOUS_LAST4: [&str; 2] = ["0000", "1234"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardRiskInput<'a> {
    pub amount_cents: i64,
    pub cpf: &'a str,
    pub email: &'a str,
    pub last4: &'a str,
    pub brand: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    pub decision: PaymentStatus,
    pub reason: &'static str,
}

impl RiskAssessment {
    fn declined(reason: &'static str) -> Self {
        Self {
            decision: PaymentStatus::Declined,
            reason,
        }
    }
}

/// Rule-based card screening. The first matching rule wins.
pub fn evaluate_card_risk(input: &CardRiskInput<'_>) -> RiskAssessment {
    if !is_digits(input.cpf, 11, 11) {
        return RiskAssessment::declined("CPF inválido");
    }
    if input.amount_cents > MAX_TICKET_CENTS {
        return RiskAssessment::declined("Ticket muito alto");
    }
    if input.email.to_ascii_lowercase().contains("@temporarymail.") {
        return RiskAssessment::declined("Email descartável");
    }
    if SUSPICIOUS_LAST4.contains(&input.last4) {
        return RiskAssessment::declined("Last4 suspeito");
    }
    RiskAssessment {
        decision: PaymentStatus::Approved,
        reason: "OK",
    }
}
