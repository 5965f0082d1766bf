use serde::{Deserialize, Serialize};
use std::fmt;

/// Fields stored in a package document.
///
/// Field names are camelCase so documents written by the mobile app parse
/// unchanged. Missing fields fall back to their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageDetails {
    pub title: String,
    pub description: String,
    pub price: i64, // smallest currency unit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekend_price: Option<i64>,
    pub features: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_guests: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// A lodging package as returned by the store.
///
/// `id` is derived from `document_key` on every read and is never written
/// back to the database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub id: i32,
    pub document_key: String,
    #[serde(flatten)]
    pub details: PackageDetails,
}

impl Package {
    pub fn new(title: impl Into<String>, price: i64) -> Self {
        Self {
            id: 0,
            document_key: String::new(),
            details: PackageDetails {
                title: title.into(),
                price,
                ..PackageDetails::default()
            },
        }
    }

    /// Attaches a stored document's identity to a set of details.
    pub fn from_details(id: i32, document_key: impl Into<String>, details: PackageDetails) -> Self {
        Self {
            id,
            document_key: document_key.into(),
            details,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.details.description = description.into();
        self
    }

    pub fn with_weekend_price(mut self, price: i64) -> Self {
        self.details.weekend_price = Some(price);
        self
    }

    pub fn with_features(mut self, features: Vec<String>) -> Self {
        self.details.features = features;
        self
    }

    pub fn with_max_guests(mut self, guests: i32) -> Self {
        self.details.max_guests = Some(guests);
        self
    }

    pub fn with_thumbnail_url(mut self, url: impl Into<String>) -> Self {
        self.details.thumbnail_url = Some(url.into());
        self
    }

    pub fn title(&self) -> &str {
        &self.details.title
    }
}

/// Formats an amount with `.` as the thousands separator (350000 -> 350.000).
pub fn format_price(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(c);
    }
    if amount < 0 {
        format!("-{}", out)
    } else {
        out
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let details = &self.details;
        writeln!(f, "{}", details.title)?;
        writeln!(f, "{}", "=".repeat(details.title.chars().count()))?;
        writeln!(f, "ID: {} (key: {})", self.id, self.document_key)?;
        writeln!(f, "Price: {}", format_price(details.price))?;

        if let Some(weekend) = details.weekend_price {
            writeln!(f, "Weekend price: {}", format_price(weekend))?;
        }
        if let Some(guests) = details.max_guests {
            writeln!(f, "Max guests: {}", guests)?;
        }

        if !details.features.is_empty() {
            writeln!(f, "\nFeatures:")?;
            for feature in &details.features {
                writeln!(f, "  - {}", feature)?;
            }
        }

        if !details.description.is_empty() {
            writeln!(f, "\n{}", details.description)?;
        }

        Ok(())
    }
}
