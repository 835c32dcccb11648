pub mod asset;
pub mod link_marker;
