mod package;

pub use package::{format_price, Package, PackageDetails};
