pub mod catalog;
pub mod compiler;
pub mod insights;
pub mod rebuild;

pub use compiler::{validate_definition, CompiledFilter, SegmentFilter};
pub use insights::{recommend_promo, InsightsService, PromoRecommendation, SegmentInsights};
pub use rebuild::SegmentRebuilder;

/// Masks a phone number for previews: numbers of five characters or fewer
/// are returned unchanged, longer ones keep the first three and last two.
pub fn mask_phone(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();
    if chars.len() <= 5 {
        return phone.to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}****{}", head, tail)
}

/// Derives a URL-friendly slug from a segment name: lowercase alphanumerics,
/// runs of anything else collapsed to a single dash.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}
