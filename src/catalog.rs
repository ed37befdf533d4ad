//! The catalog records exchanged across the bridge, and their JSON wire formats.
//!
//! A [`CanonicalCatalog`] is what the application knows about its subscriptions. A
//! [`PlatformCatalog`] is what is left of it after the billing backend has priced it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::billing::SkuDetails;
use crate::error::{ContractViolation, Error};

/// A subscription product as the application's own catalog describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    #[serde(rename = "featured_product")]
    pub is_featured: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

/// The ordered list of products to look up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalCatalog {
    pub products: Vec<CanonicalProduct>,
}

impl CanonicalCatalog {
    /// Decodes and validates a serialized catalog.
    ///
    /// Unknown keys are ignored. Every product must carry a non-empty `id`; the
    /// uniqueness of ids is left to whoever owns the catalog.
    pub fn decode(serialized: &str) -> Result<Self, ContractViolation> {
        let catalog: Self = serde_json::from_str(serialized)
            .map_err(|e| ContractViolation::Malformed(e.to_string()))?;

        if let Some(index) = catalog.products.iter().position(|p| p.id.is_empty()) {
            return Err(ContractViolation::EmptyProductId { index });
        }

        Ok(catalog)
    }

    /// Like [`CanonicalCatalog::decode`], for an argument that crossed a foreign
    /// function boundary and may not have been readable at all.
    pub fn decode_argument<E: fmt::Display>(
        argument: Result<String, E>,
    ) -> Result<Self, ContractViolation> {
        let serialized = argument.map_err(|e| ContractViolation::Unreadable(e.to_string()))?;
        Self::decode(&serialized)
    }

    /// The product identifiers, in lookup order.
    pub fn ids(&self) -> Vec<String> {
        self.products.iter().map(|p| p.id.clone()).collect()
    }

    pub fn find(&self, id: &str) -> Option<&CanonicalProduct> {
        self.products.iter().find(|p| p.id == id)
    }

    /// The first product flagged as featured, if any.
    pub fn featured(&self) -> Option<&CanonicalProduct> {
        self.products.iter().find(|p| p.is_featured)
    }

    /// Returns the only product of a catalog meant for a purchase.
    pub fn single(&self) -> Result<&CanonicalProduct, ContractViolation> {
        match self.products.as_slice() {
            [product] => Ok(product),
            products => Err(ContractViolation::PurchaseCatalogSize {
                count: products.len(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

/// The backend's pricing for one product of the canonical catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformOffer {
    /// Matches [`CanonicalProduct::id`].
    pub sku: String,
    pub description: String,
    #[serde(rename = "price")]
    pub display_price: String,
    #[serde(rename = "priceCurrencyCode")]
    pub currency_code: String,
}

impl From<SkuDetails> for PlatformOffer {
    fn from(details: SkuDetails) -> Self {
        Self {
            sku: details.sku,
            description: details.description,
            display_price: details.price,
            currency_code: details.price_currency_code,
        }
    }
}

/// The reconciled catalog, in the order the backend returned its records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCatalog {
    pub products: Vec<PlatformOffer>,
}

impl PlatformCatalog {
    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(serialized: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(serialized)?)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}
