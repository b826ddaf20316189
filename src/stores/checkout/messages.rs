//! Message templates
//!
//! Sellers and buyers see these strings verbatim; identical inputs must give
//! identical text.

use nostr_sdk::prelude::*;

use super::order::{ContactInfo, Fulfillment, Order, ShippingInfo};

/// npub for display, hex if encoding fails
pub fn display_npub(pubkey: &PublicKey) -> String {
    pubkey.to_bech32().unwrap_or_else(|_| pubkey.to_hex())
}

/// Token message to the seller
pub fn payment_message(title: &str, buyer: Option<&PublicKey>, marketplace: &str, token: &str) -> String {
    let from = buyer
        .map(display_npub)
        .unwrap_or_else(|| "an anonymous buyer".to_string());
    format!(
        "This is a Cashu token payment from {} for your {} listing on {}: {}",
        from, title, marketplace, token
    )
}

/// Address lines in order, skipping blanks
pub fn shipping_message(info: &ShippingInfo) -> String {
    let parts: Vec<&str> = [
        Some(info.address.as_str()),
        info.unit.as_deref(),
        Some(info.city.as_str()),
        Some(info.postal_code.as_str()),
        Some(info.state.as_str()),
        Some(info.country.as_str()),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .filter(|part| !part.is_empty())
    .collect();

    format!("Please ship the product to {} at {}.", info.name.trim(), parts.join(", "))
}

pub fn contact_message(title: &str, info: &ContactInfo) -> String {
    let mut message = format!(
        "To finalize the sale of your {} listing, please reach the buyer by {} at {}.",
        title,
        info.contact_type.trim(),
        info.contact.trim()
    );
    if let Some(instructions) = info.instructions.as_deref().map(str::trim).filter(|i| !i.is_empty()) {
        message.push_str(&format!(" Additional instructions: {}", instructions));
    }
    message
}

fn size_note(size: &str) -> String {
    format!("This purchase was for a size {}.", size)
}

/// Delivery details for the seller, or None when there is nothing to send
pub fn fulfillment_message(order: &Order) -> Option<String> {
    let details = match &order.fulfillment {
        Fulfillment::None => None,
        Fulfillment::Shipping(info) => Some(shipping_message(info)),
        Fulfillment::Contact(info) => Some(contact_message(&order.product.title, info)),
    };

    match (order.selected_size.as_deref(), details) {
        (Some(size), Some(details)) => Some(format!("{} {}", size_note(size), details)),
        (Some(size), None) => Some(size_note(size)),
        (None, details) => details,
    }
}

/// Confirmation back to the buyer
pub fn receipt_message(title: &str, seller: &PublicKey) -> String {
    format!(
        "Your order for {} was processed successfully. If applicable, you should be receiving delivery \
         information from {} as soon as they review your order.",
        title,
        display_npub(seller)
    )
}
