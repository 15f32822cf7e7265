//! Anchor wire layouts for the discount platform program.
//!
//! Events arrive as `Program data: <base64>` log lines and accounts as base64 blobs from
//! `getAccountInfo`. Both start with an 8 byte discriminator (the first bytes of
//! `sha256("event:<Name>")` or `sha256("account:<Name>")`) followed by a Borsh payload.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use crate::store::{EntityType, WatchedFields};

/// Length of an Anchor discriminator prefix.
pub const DISCRIMINATOR_LEN: usize = 8;

/// Errors raised while decoding event or account bytes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload too short: {0} bytes")]
    TooShort(usize),

    #[error("unknown event discriminator {0}")]
    UnknownDiscriminator(String),

    #[error("account discriminator mismatch for {entity_type}: found {found}")]
    AccountMismatch {
        entity_type: EntityType,
        found: String,
    },

    #[error("borsh decode error: {0}")]
    Borsh(#[from] std::io::Error),
}

fn discriminator(namespace: &str, name: &str) -> [u8; DISCRIMINATOR_LEN] {
    let digest = Sha256::digest(format!("{namespace}:{name}").as_bytes());
    let mut out = [0u8; DISCRIMINATOR_LEN];
    out.copy_from_slice(&digest[..DISCRIMINATOR_LEN]);
    out
}

/// Discriminator Anchor prepends to an emitted event.
pub fn event_discriminator(name: &str) -> [u8; DISCRIMINATOR_LEN] {
    discriminator("event", name)
}

/// Discriminator Anchor prepends to account data.
pub fn account_discriminator(name: &str) -> [u8; DISCRIMINATOR_LEN] {
    discriminator("account", name)
}

/// A 32 byte ledger address, displayed in base58.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub struct Pubkey(pub [u8; 32]);

impl fmt::Display for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pubkey({self})")
    }
}

impl Serialize for Pubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, BorshSerialize, BorshDeserialize)]
pub struct MerchantRegistered {
    pub merchant: Pubkey,
    pub name: String,
    pub category: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, BorshSerialize, BorshDeserialize)]
pub struct PromotionCreated {
    pub promotion: Pubkey,
    pub merchant: Pubkey,
    pub discount_percentage: u8,
    pub max_supply: u32,
    pub price: u64,
    pub expiry_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, BorshSerialize, BorshDeserialize)]
pub struct CouponMinted {
    pub coupon: Pubkey,
    pub promotion: Pubkey,
    pub owner: Pubkey,
    pub coupon_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, BorshSerialize, BorshDeserialize)]
pub struct CouponTransferred {
    pub coupon: Pubkey,
    pub from: Pubkey,
    pub to: Pubkey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, BorshSerialize, BorshDeserialize)]
pub struct CouponRedeemed {
    pub coupon: Pubkey,
    pub owner: Pubkey,
    pub merchant: Pubkey,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, BorshSerialize, BorshDeserialize)]
pub struct CouponListed {
    pub listing: Pubkey,
    pub coupon: Pubkey,
    pub seller: Pubkey,
    pub price: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, BorshSerialize, BorshDeserialize)]
pub struct CouponSold {
    pub coupon: Pubkey,
    pub seller: Pubkey,
    pub buyer: Pubkey,
    pub price: u64,
    pub marketplace_fee: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, BorshSerialize, BorshDeserialize)]
pub struct ListingCancelled {
    pub listing: Pubkey,
    pub coupon: Pubkey,
    pub seller: Pubkey,
    pub timestamp: i64,
}

/// The closed set of events the program emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MerchantRegistered,
    PromotionCreated,
    CouponMinted,
    CouponTransferred,
    CouponRedeemed,
    CouponListed,
    CouponSold,
    ListingCancelled,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::MerchantRegistered,
        EventKind::PromotionCreated,
        EventKind::CouponMinted,
        EventKind::CouponTransferred,
        EventKind::CouponRedeemed,
        EventKind::CouponListed,
        EventKind::CouponSold,
        EventKind::ListingCancelled,
    ];

    /// The event name as declared by the program.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MerchantRegistered => "MerchantRegistered",
            EventKind::PromotionCreated => "PromotionCreated",
            EventKind::CouponMinted => "CouponMinted",
            EventKind::CouponTransferred => "CouponTransferred",
            EventKind::CouponRedeemed => "CouponRedeemed",
            EventKind::CouponListed => "CouponListed",
            EventKind::CouponSold => "CouponSold",
            EventKind::ListingCancelled => "ListingCancelled",
        }
    }

    pub fn discriminator(&self) -> [u8; DISCRIMINATOR_LEN] {
        event_discriminator(self.as_str())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static EVENT_KINDS: LazyLock<HashMap<[u8; DISCRIMINATOR_LEN], EventKind>> = LazyLock::new(|| {
    EventKind::ALL
        .iter()
        .map(|kind| (kind.discriminator(), *kind))
        .collect()
});

/// A decoded program event, serialized as `{"name": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "name", content = "data")]
pub enum ProgramEvent {
    MerchantRegistered(MerchantRegistered),
    PromotionCreated(PromotionCreated),
    CouponMinted(CouponMinted),
    CouponTransferred(CouponTransferred),
    CouponRedeemed(CouponRedeemed),
    CouponListed(CouponListed),
    CouponSold(CouponSold),
    ListingCancelled(ListingCancelled),
}

impl ProgramEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProgramEvent::MerchantRegistered(_) => EventKind::MerchantRegistered,
            ProgramEvent::PromotionCreated(_) => EventKind::PromotionCreated,
            ProgramEvent::CouponMinted(_) => EventKind::CouponMinted,
            ProgramEvent::CouponTransferred(_) => EventKind::CouponTransferred,
            ProgramEvent::CouponRedeemed(_) => EventKind::CouponRedeemed,
            ProgramEvent::CouponListed(_) => EventKind::CouponListed,
            ProgramEvent::CouponSold(_) => EventKind::CouponSold,
            ProgramEvent::ListingCancelled(_) => EventKind::ListingCancelled,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// Decode discriminator-prefixed event bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < DISCRIMINATOR_LEN {
            return Err(CodecError::TooShort(bytes.len()));
        }
        let (head, payload) = bytes.split_at(DISCRIMINATOR_LEN);
        let kind = EVENT_KINDS
            .get(head)
            .copied()
            .ok_or_else(|| CodecError::UnknownDiscriminator(hex::encode(head)))?;

        let event = match kind {
            EventKind::MerchantRegistered => {
                ProgramEvent::MerchantRegistered(borsh::from_slice(payload)?)
            }
            EventKind::PromotionCreated => {
                ProgramEvent::PromotionCreated(borsh::from_slice(payload)?)
            }
            EventKind::CouponMinted => ProgramEvent::CouponMinted(borsh::from_slice(payload)?),
            EventKind::CouponTransferred => {
                ProgramEvent::CouponTransferred(borsh::from_slice(payload)?)
            }
            EventKind::CouponRedeemed => ProgramEvent::CouponRedeemed(borsh::from_slice(payload)?),
            EventKind::CouponListed => ProgramEvent::CouponListed(borsh::from_slice(payload)?),
            EventKind::CouponSold => ProgramEvent::CouponSold(borsh::from_slice(payload)?),
            EventKind::ListingCancelled => {
                ProgramEvent::ListingCancelled(borsh::from_slice(payload)?)
            }
        };
        Ok(event)
    }

    /// Encode the event the way the program emits it.
    #[cfg(test)]
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut bytes = self.kind().discriminator().to_vec();
        match self {
            ProgramEvent::MerchantRegistered(e) => BorshSerialize::serialize(e, &mut bytes)?,
            ProgramEvent::PromotionCreated(e) => BorshSerialize::serialize(e, &mut bytes)?,
            ProgramEvent::CouponMinted(e) => BorshSerialize::serialize(e, &mut bytes)?,
            ProgramEvent::CouponTransferred(e) => BorshSerialize::serialize(e, &mut bytes)?,
            ProgramEvent::CouponRedeemed(e) => BorshSerialize::serialize(e, &mut bytes)?,
            ProgramEvent::CouponListed(e) => BorshSerialize::serialize(e, &mut bytes)?,
            ProgramEvent::CouponSold(e) => BorshSerialize::serialize(e, &mut bytes)?,
            ProgramEvent::ListingCancelled(e) => BorshSerialize::serialize(e, &mut bytes)?,
        }
        Ok(bytes)
    }
}

/// Leading fields of the on-chain `Promotion` account, up to the last watched field.
/// Trailing fields (timestamps, location data) are left unread.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PromotionAccountHead {
    pub merchant: Pubkey,
    pub discount_percentage: u8,
    pub max_supply: u32,
    pub current_supply: u32,
    pub expiry_timestamp: i64,
    pub category: String,
    pub description: String,
    pub price: u64,
    pub is_active: bool,
}

/// The on-chain `Coupon` account.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CouponAccount {
    pub id: u64,
    pub promotion: Pubkey,
    pub owner: Pubkey,
    pub merchant: Pubkey,
    pub discount_percentage: u8,
    pub expiry_timestamp: i64,
    pub is_redeemed: bool,
    pub redeemed_at: i64,
    pub created_at: i64,
}

/// Decode raw account data into the watched fields of `entity_type`.
pub fn decode_account(entity_type: EntityType, data: &[u8]) -> Result<WatchedFields, CodecError> {
    if data.len() < DISCRIMINATOR_LEN {
        return Err(CodecError::TooShort(data.len()));
    }
    let (head, mut rest) = data.split_at(DISCRIMINATOR_LEN);
    if head != account_discriminator(entity_type.account_name()) {
        return Err(CodecError::AccountMismatch {
            entity_type,
            found: hex::encode(head),
        });
    }

    let fields = match entity_type {
        EntityType::Promotion => {
            let account = PromotionAccountHead::deserialize(&mut rest)?;
            WatchedFields::Promotion {
                current_supply: account.current_supply,
                is_active: account.is_active,
            }
        }
        EntityType::Coupon => {
            let account = CouponAccount::deserialize(&mut rest)?;
            WatchedFields::Coupon {
                owner: account.owner.to_string(),
                is_redeemed: account.is_redeemed,
            }
        }
    };
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> Pubkey {
        Pubkey([byte; 32])
    }

    #[test]
    fn event_bytes_decode_to_typed_event() {
        let event = ProgramEvent::CouponMinted(CouponMinted {
            coupon: key(1),
            promotion: key(2),
            owner: key(3),
            coupon_id: 42,
        });
        let bytes = event.encode().unwrap();

        assert_eq!(&bytes[..8], &event_discriminator("CouponMinted"));
        assert_eq!(ProgramEvent::decode(&bytes).unwrap(), event);
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let mut bytes = event_discriminator("SomethingElse").to_vec();
        bytes.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            ProgramEvent::decode(&bytes),
            Err(CodecError::UnknownDiscriminator(_))
        ));
    }

    #[test]
    fn truncated_payload_is_a_borsh_error() {
        let mut bytes = EventKind::CouponRedeemed.discriminator().to_vec();
        bytes.extend_from_slice(&[7u8; 10]);
        assert!(matches!(ProgramEvent::decode(&bytes), Err(CodecError::Borsh(_))));
    }

    #[test]
    fn event_serializes_with_name_and_data() {
        let event = ProgramEvent::CouponTransferred(CouponTransferred {
            coupon: key(1),
            from: key(2),
            to: key(3),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["name"], "CouponTransferred");
        assert_eq!(json["data"]["to"], key(3).to_string());
    }

    #[test]
    fn promotion_account_ignores_trailing_fields() {
        let mut data = account_discriminator("Promotion").to_vec();
        PromotionAccountHead {
            merchant: key(9),
            discount_percentage: 20,
            max_supply: 100,
            current_supply: 7,
            expiry_timestamp: 1_900_000_000,
            category: "food".to_string(),
            description: "two for one".to_string(),
            price: 1_000,
            is_active: true,
        }
        .serialize(&mut data)
        .unwrap();
        // created_at plus location data follow on chain
        data.extend_from_slice(&[0u8; 40]);

        let fields = decode_account(EntityType::Promotion, &data).unwrap();
        assert_eq!(
            fields,
            WatchedFields::Promotion {
                current_supply: 7,
                is_active: true,
            }
        );
    }

    #[test]
    fn coupon_account_renders_owner_in_base58() {
        let mut data = account_discriminator("Coupon").to_vec();
        CouponAccount {
            id: 1,
            promotion: key(2),
            owner: key(3),
            merchant: key(4),
            discount_percentage: 10,
            expiry_timestamp: 0,
            is_redeemed: true,
            redeemed_at: 5,
            created_at: 1,
        }
        .serialize(&mut data)
        .unwrap();

        let fields = decode_account(EntityType::Coupon, &data).unwrap();
        assert_eq!(
            fields,
            WatchedFields::Coupon {
                owner: bs58::encode([3u8; 32]).into_string(),
                is_redeemed: true,
            }
        );
    }

    #[test]
    fn account_of_wrong_type_is_rejected() {
        let mut data = account_discriminator("Coupon").to_vec();
        data.extend_from_slice(&[0u8; 64]);
        assert!(matches!(
            decode_account(EntityType::Promotion, &data),
            Err(CodecError::AccountMismatch { .. })
        ));
    }
}
