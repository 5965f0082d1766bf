use clap::{Args, Subcommand};
use futures::StreamExt;

use super::OutputFormat;
use homestay::db::{DocumentClient, PackageRepository};
use homestay::models::{format_price, Package};

#[derive(Args)]
pub struct PackageCommand {
    #[command(subcommand)]
    pub command: PackageSubcommand,
}

#[derive(Subcommand)]
pub enum PackageSubcommand {
    /// Add a new package
    Add {
        /// Package title
        title: String,

        /// Weekday price
        #[arg(long)]
        price: i64,

        /// Description
        #[arg(long)]
        description: Option<String>,

        /// Weekend price
        #[arg(long)]
        weekend_price: Option<i64>,

        /// Included features (can be repeated)
        #[arg(long = "feature", value_name = "FEATURE")]
        features: Vec<String>,

        /// Maximum number of guests
        #[arg(long)]
        max_guests: Option<i32>,

        /// Thumbnail image URL
        #[arg(long)]
        thumbnail_url: Option<String>,
    },

    /// List all packages
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a package's details
    Show {
        /// Package ID
        #[arg(allow_negative_numbers = true)]
        id: i32,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Update an existing package
    Update {
        /// Package ID
        #[arg(allow_negative_numbers = true)]
        id: i32,

        /// New title
        #[arg(long)]
        title: Option<String>,

        /// New weekday price
        #[arg(long)]
        price: Option<i64>,

        /// New description
        #[arg(long)]
        description: Option<String>,

        /// New weekend price
        #[arg(long)]
        weekend_price: Option<i64>,

        /// Add a feature (can be repeated)
        #[arg(long = "add-feature", value_name = "FEATURE")]
        add_features: Vec<String>,

        /// Remove a feature (can be repeated)
        #[arg(long = "remove-feature", value_name = "FEATURE")]
        remove_features: Vec<String>,

        /// Maximum number of guests
        #[arg(long)]
        max_guests: Option<i32>,

        /// Thumbnail image URL
        #[arg(long)]
        thumbnail_url: Option<String>,
    },

    /// Delete a package by ID or by document key
    Delete {
        /// Package ID
        #[arg(
            allow_negative_numbers = true,
            required_unless_present = "key",
            conflicts_with = "key"
        )]
        id: Option<i32>,

        /// Document key
        #[arg(long)]
        key: Option<String>,
    },

    /// Print the package list every time it changes
    Watch {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

fn print_packages(packages: &[Package], format: &OutputFormat) -> Result<(), serde_json::Error> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(packages)?);
        }
        OutputFormat::Text => {
            if packages.is_empty() {
                println!("No packages found");
                return Ok(());
            }
            println!("{:>11}  {:<30}  {:>12}  KEY", "ID", "TITLE", "PRICE");
            println!("{}", "-".repeat(80));
            for package in packages {
                let title = package.title();
                let title = if title.chars().count() > 30 {
                    format!("{}...", title.chars().take(27).collect::<String>())
                } else {
                    title.to_string()
                };
                println!(
                    "{:>11}  {:<30}  {:>12}  {}",
                    package.id,
                    title,
                    format_price(package.details.price),
                    package.document_key
                );
            }
            println!("\nTotal: {} package(s)", packages.len());
        }
    }
    Ok(())
}

impl PackageCommand {
    pub async fn run<C: DocumentClient>(
        &self,
        repo: &PackageRepository<C>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            PackageSubcommand::Add {
                title,
                price,
                description,
                weekend_price,
                features,
                max_guests,
                thumbnail_url,
            } => {
                if title.trim().is_empty() {
                    return Err("Package title cannot be empty".into());
                }
                if *price < 0 {
                    return Err("Price cannot be negative".into());
                }

                let mut package = Package::new(title.trim(), *price);
                if let Some(description) = description {
                    package = package.with_description(description);
                }
                if let Some(weekend_price) = weekend_price {
                    package = package.with_weekend_price(*weekend_price);
                }
                if !features.is_empty() {
                    package = package.with_features(features.clone());
                }
                if let Some(max_guests) = max_guests {
                    package = package.with_max_guests(*max_guests);
                }
                if let Some(url) = thumbnail_url {
                    package = package.with_thumbnail_url(url);
                }

                let created = repo.create(&package).await?;
                println!("Created package:");
                println!("{}", created);
                Ok(())
            }

            PackageSubcommand::List { format } => {
                let packages = repo.get_all().await?;
                print_packages(&packages, format)?;
                Ok(())
            }

            PackageSubcommand::Show { id, format } => match repo.get_by_id(*id).await? {
                Some(package) => {
                    match format {
                        OutputFormat::Json => {
                            println!("{}", serde_json::to_string_pretty(&package)?);
                        }
                        OutputFormat::Text => {
                            println!("{}", package);
                        }
                    }
                    Ok(())
                }
                None => Err(format!("Package not found: {}", id).into()),
            },

            PackageSubcommand::Update {
                id,
                title,
                price,
                description,
                weekend_price,
                add_features,
                remove_features,
                max_guests,
                thumbnail_url,
            } => {
                let has_updates = title.is_some()
                    || price.is_some()
                    || description.is_some()
                    || weekend_price.is_some()
                    || !add_features.is_empty()
                    || !remove_features.is_empty()
                    || max_guests.is_some()
                    || thumbnail_url.is_some();

                if !has_updates {
                    return Err("Nothing to update. Provide at least one option.".into());
                }

                let mut package = repo
                    .get_by_id(*id)
                    .await?
                    .ok_or_else(|| format!("Package not found: {}", id))?;

                let details = &mut package.details;
                if let Some(title) = title {
                    if title.trim().is_empty() {
                        return Err("Package title cannot be empty".into());
                    }
                    details.title = title.trim().to_string();
                }
                if let Some(price) = price {
                    details.price = *price;
                }
                if let Some(description) = description {
                    details.description = description.clone();
                }
                if weekend_price.is_some() {
                    details.weekend_price = *weekend_price;
                }
                for feature in add_features {
                    if !details.features.iter().any(|f| f.eq_ignore_ascii_case(feature)) {
                        details.features.push(feature.clone());
                    }
                }
                details
                    .features
                    .retain(|f| !remove_features.iter().any(|r| r.eq_ignore_ascii_case(f)));
                if max_guests.is_some() {
                    details.max_guests = *max_guests;
                }
                if thumbnail_url.is_some() {
                    details.thumbnail_url = thumbnail_url.clone();
                }

                repo.update(&package).await?;
                println!("Updated package:");
                println!("{}", package);
                Ok(())
            }

            PackageSubcommand::Delete { id, key } => {
                match (id, key) {
                    (_, Some(key)) => {
                        repo.delete_by_document_key(key).await?;
                        println!("Deleted package with key {}", key);
                    }
                    (Some(id), None) => {
                        repo.delete_by_id(*id).await?;
                        println!("Deleted package {}", id);
                    }
                    (None, None) => return Err("Provide a package ID or --key".into()),
                }
                Ok(())
            }

            PackageSubcommand::Watch { format } => {
                let mut packages = repo.subscribe();
                loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            println!();
                            return Ok(());
                        }
                        update = packages.next() => match update {
                            Some(Ok(list)) => {
                                if matches!(format, OutputFormat::Text) {
                                    println!("--- {} ---", chrono::Local::now().format("%H:%M:%S"));
                                }
                                print_packages(&list, format)?;
                            }
                            Some(Err(e)) => return Err(e.into()),
                            None => return Ok(()),
                        }
                    }
                }
            }
        }
    }
}
