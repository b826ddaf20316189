//! Orders and the checkout session state machine
//!
//! A session walks `ChoosingPaymentMethod -> ChoosingDeliveryOption ->
//! {CollectingShipping | CollectingContact} -> SettlingPayment ->
//! DispatchingMessages -> UpdatingLedgerAndHistory -> Done`. Which collection
//! stage applies is decided by the listing's shipping type and the buyer's
//! delivery choice.

use std::fmt;
use std::str::FromStr;

use nostr_sdk::PublicKey;
use serde::{Deserialize, Serialize};

use crate::services::fiat_rates::PriceError;
use crate::stores::cashu::errors::CashuWalletError;
use crate::stores::cashu::types::PaymentMethod;
use crate::stores::gift_wrap::EnvelopeError;

// =============================================================================
// Listing Data
// =============================================================================

/// Shipping tag of a listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ShippingType {
    NotApplicable,
    Free,
    Pickup,
    FreeOrPickup,
    AddedCost,
}

impl ShippingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotApplicable => "N/A",
            Self::Free => "Free",
            Self::Pickup => "Pickup",
            Self::FreeOrPickup => "Free/Pickup",
            Self::AddedCost => "Added Cost",
        }
    }

    /// Whether the buyer must pick between shipping and pickup
    pub fn needs_delivery_choice(&self) -> bool {
        matches!(self, Self::FreeOrPickup)
    }
}

impl fmt::Display for ShippingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ShippingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "N/A" => Ok(Self::NotApplicable),
            "Free" => Ok(Self::Free),
            "Pickup" => Ok(Self::Pickup),
            "Free/Pickup" => Ok(Self::FreeOrPickup),
            "Added Cost" => Ok(Self::AddedCost),
            other => Err(format!("Unknown shipping type: {}", other)),
        }
    }
}

impl TryFrom<String> for ShippingType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ShippingType> for String {
    fn from(value: ShippingType) -> Self {
        value.as_str().to_string()
    }
}

/// How the buyer wants to receive the item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryChoice {
    /// Handed over in person; no details are collected
    InPerson,
    Shipping,
    Pickup,
}

/// The listing being bought
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub title: String,
    pub seller: PublicKey,
    /// Listing coordinate (`30402:<pubkey>:<d>`)
    pub listing: Option<String>,
    pub price: f64,
    pub currency: String,
    pub shipping_type: ShippingType,
    /// Charged once per order when the item ships with added cost
    pub shipping_cost: f64,
}

// =============================================================================
// Fulfilment Data
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShippingInfo {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub unit: Option<String>,
    pub city: String,
    pub postal_code: String,
    pub state: String,
    pub country: String,
}

impl ShippingInfo {
    fn missing_field(&self) -> Option<&'static str> {
        [
            ("name", &self.name),
            ("address", &self.address),
            ("city", &self.city),
            ("postal code", &self.postal_code),
            ("state", &self.state),
            ("country", &self.country),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
    }
}

/// Where the seller can reach the buyer to arrange a pickup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub contact: String,
    /// e.g. "email", "phone", "nostr"
    pub contact_type: String,
    #[serde(default)]
    pub instructions: Option<String>,
}

impl ContactInfo {
    fn missing_field(&self) -> Option<&'static str> {
        if self.contact.trim().is_empty() {
            Some("contact")
        } else if self.contact_type.trim().is_empty() {
            Some("contact type")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fulfillment {
    None,
    Shipping(ShippingInfo),
    Contact(ContactInfo),
}

/// A fully specified order, ready to pay for
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub product: Product,
    pub quantity: u32,
    pub payment_method: PaymentMethod,
    pub delivery: DeliveryChoice,
    pub fulfillment: Fulfillment,
    pub selected_size: Option<String>,
}

impl Order {
    /// Total in the listing currency
    pub fn total(&self) -> f64 {
        let items = self.product.price * f64::from(self.quantity);
        if self.delivery == DeliveryChoice::Shipping && self.product.shipping_type == ShippingType::AddedCost {
            items + self.product.shipping_cost
        } else {
            items
        }
    }

    /// True when the seller gets a second message with delivery details
    pub fn has_fulfillment_details(&self) -> bool {
        self.fulfillment != Fulfillment::None || self.selected_size.is_some()
    }
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub enum CheckoutError {
    InvalidTransition { stage: CheckoutStage, action: &'static str },
    DeliveryChoiceRequired,
    DeliveryNotOffered { shipping_type: ShippingType, choice: DeliveryChoice },
    MissingField(&'static str),
    InvalidQuantity,
    Price(PriceError),
    Settlement(CashuWalletError),
    /// Payment settled but an order message was not delivered
    Delivery { token: String, source: EnvelopeError },
}

impl fmt::Display for CheckoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { stage, action } => {
                write!(f, "Cannot {} while {:?}", action, stage)
            }
            Self::DeliveryChoiceRequired => write!(f, "Choose shipping, pickup or in-person delivery"),
            Self::DeliveryNotOffered { shipping_type, choice } => {
                write!(f, "{:?} is not offered for {} listings", choice, shipping_type)
            }
            Self::MissingField(field) => write!(f, "Missing required field: {}", field),
            Self::InvalidQuantity => write!(f, "Quantity must be at least 1"),
            Self::Price(e) => write!(f, "{}", e),
            Self::Settlement(e) => write!(f, "{}", e),
            Self::Delivery { source, .. } => write!(f, "Payment sent but order messages failed: {}", source),
        }
    }
}

impl std::error::Error for CheckoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Price(e) => Some(e),
            Self::Settlement(e) => Some(e),
            Self::Delivery { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<PriceError> for CheckoutError {
    fn from(e: PriceError) -> Self {
        Self::Price(e)
    }
}

impl From<CashuWalletError> for CheckoutError {
    fn from(e: CashuWalletError) -> Self {
        Self::Settlement(e)
    }
}

// =============================================================================
// Session
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutStage {
    ChoosingPaymentMethod,
    ChoosingDeliveryOption,
    CollectingShipping,
    CollectingContact,
    SettlingPayment,
    DispatchingMessages,
    UpdatingLedgerAndHistory,
    Done,
    Failed,
}

/// One buyer walking through checkout for one listing
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    stage: CheckoutStage,
    product: Product,
    quantity: u32,
    payment_method: Option<PaymentMethod>,
    delivery: Option<DeliveryChoice>,
    fulfillment: Fulfillment,
    selected_size: Option<String>,
}

impl CheckoutSession {
    pub fn new(product: Product, quantity: u32) -> Result<Self, CheckoutError> {
        if quantity == 0 {
            return Err(CheckoutError::InvalidQuantity);
        }

        Ok(Self {
            stage: CheckoutStage::ChoosingPaymentMethod,
            product,
            quantity,
            payment_method: None,
            delivery: None,
            fulfillment: Fulfillment::None,
            selected_size: None,
        })
    }

    pub fn stage(&self) -> CheckoutStage {
        self.stage
    }

    pub fn product(&self) -> &Product {
        &self.product
    }

    pub fn payment_method(&self) -> Option<PaymentMethod> {
        self.payment_method
    }

    fn expect_stage(&self, expected: &[CheckoutStage], action: &'static str) -> Result<(), CheckoutError> {
        if expected.contains(&self.stage) {
            Ok(())
        } else {
            Err(CheckoutError::InvalidTransition {
                stage: self.stage,
                action,
            })
        }
    }

    /// Size note for the seller; allowed until payment starts
    pub fn select_size(&mut self, size: impl Into<String>) -> Result<(), CheckoutError> {
        self.expect_stage(
            &[
                CheckoutStage::ChoosingPaymentMethod,
                CheckoutStage::ChoosingDeliveryOption,
                CheckoutStage::CollectingShipping,
                CheckoutStage::CollectingContact,
            ],
            "select a size",
        )?;

        let size = size.into();
        self.selected_size = if size.trim().is_empty() { None } else { Some(size) };
        Ok(())
    }

    pub fn choose_payment_method(&mut self, method: PaymentMethod) -> Result<CheckoutStage, CheckoutError> {
        self.expect_stage(&[CheckoutStage::ChoosingPaymentMethod], "choose a payment method")?;
        self.payment_method = Some(method);
        self.stage = CheckoutStage::ChoosingDeliveryOption;
        Ok(self.stage)
    }

    /// Resolve which details must be collected
    ///
    /// `None` takes the listing's only delivery route; `Free/Pickup` listings
    /// require an explicit choice.
    pub fn choose_delivery(&mut self, choice: Option<DeliveryChoice>) -> Result<CheckoutStage, CheckoutError> {
        self.expect_stage(&[CheckoutStage::ChoosingDeliveryOption], "choose delivery")?;

        let shipping_type = self.product.shipping_type;
        let delivery = match (shipping_type, choice) {
            (_, Some(DeliveryChoice::InPerson)) => DeliveryChoice::InPerson,
            (ShippingType::FreeOrPickup, Some(choice)) => choice,
            (ShippingType::FreeOrPickup, None) => return Err(CheckoutError::DeliveryChoiceRequired),
            (ShippingType::Free | ShippingType::AddedCost, None | Some(DeliveryChoice::Shipping)) => {
                DeliveryChoice::Shipping
            }
            (ShippingType::NotApplicable | ShippingType::Pickup, None | Some(DeliveryChoice::Pickup)) => {
                DeliveryChoice::Pickup
            }
            (_, Some(choice)) => {
                return Err(CheckoutError::DeliveryNotOffered { shipping_type, choice });
            }
        };

        self.delivery = Some(delivery);
        self.fulfillment = Fulfillment::None;
        self.stage = match delivery {
            DeliveryChoice::InPerson => CheckoutStage::SettlingPayment,
            DeliveryChoice::Shipping => CheckoutStage::CollectingShipping,
            DeliveryChoice::Pickup => CheckoutStage::CollectingContact,
        };

        log::debug!("Delivery for {} listing: {:?} -> {:?}", shipping_type, delivery, self.stage);
        Ok(self.stage)
    }

    pub fn provide_shipping(&mut self, info: ShippingInfo) -> Result<CheckoutStage, CheckoutError> {
        self.expect_stage(&[CheckoutStage::CollectingShipping], "provide a shipping address")?;
        if let Some(field) = info.missing_field() {
            return Err(CheckoutError::MissingField(field));
        }
        self.fulfillment = Fulfillment::Shipping(info);
        self.stage = CheckoutStage::SettlingPayment;
        Ok(self.stage)
    }

    pub fn provide_contact(&mut self, info: ContactInfo) -> Result<CheckoutStage, CheckoutError> {
        self.expect_stage(&[CheckoutStage::CollectingContact], "provide contact details")?;
        if let Some(field) = info.missing_field() {
            return Err(CheckoutError::MissingField(field));
        }
        self.fulfillment = Fulfillment::Contact(info);
        self.stage = CheckoutStage::SettlingPayment;
        Ok(self.stage)
    }

    /// The order as collected so far; only complete once payment can start
    pub fn order(&self) -> Result<Order, CheckoutError> {
        self.expect_stage(&[CheckoutStage::SettlingPayment], "start payment")?;

        let (Some(payment_method), Some(delivery)) = (self.payment_method, self.delivery) else {
            return Err(CheckoutError::InvalidTransition {
                stage: self.stage,
                action: "start payment",
            });
        };

        Ok(Order {
            product: self.product.clone(),
            quantity: self.quantity,
            payment_method,
            delivery,
            fulfillment: self.fulfillment.clone(),
            selected_size: self.selected_size.clone(),
        })
    }

    /// Move along the post-payment stages; only forward steps are allowed
    pub(crate) fn advance(&mut self, next: CheckoutStage) -> Result<(), CheckoutError> {
        let allowed = matches!(
            (self.stage, next),
            (CheckoutStage::SettlingPayment, CheckoutStage::DispatchingMessages)
                | (CheckoutStage::DispatchingMessages, CheckoutStage::UpdatingLedgerAndHistory)
                | (CheckoutStage::UpdatingLedgerAndHistory, CheckoutStage::Done)
        );
        if !allowed {
            return Err(CheckoutError::InvalidTransition {
                stage: self.stage,
                action: "advance checkout",
            });
        }
        self.stage = next;
        Ok(())
    }

    pub(crate) fn fail(&mut self) {
        self.stage = CheckoutStage::Failed;
    }

    /// Start over after a failed attempt, keeping the collected details
    pub fn retry(&mut self) -> Result<CheckoutStage, CheckoutError> {
        self.expect_stage(&[CheckoutStage::Failed], "retry")?;
        self.stage = CheckoutStage::SettlingPayment;
        Ok(self.stage)
    }
}
