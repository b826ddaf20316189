/// Render a sat amount for logs and messages, e.g. "1,234 sats"
pub fn format_sats(amount: u64) -> String {
    let digits = amount.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);

    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    if amount == 1 {
        format!("{} sat", grouped)
    } else {
        format!("{} sats", grouped)
    }
}

/// Shorten a hex key for log lines ("abcd1234…wxyz5678")
pub fn short_key(key: &str) -> String {
    if key.len() <= 16 || !key.is_ascii() {
        return key.to_string();
    }
    format!("{}…{}", &key[..8], &key[key.len() - 8..])
}
