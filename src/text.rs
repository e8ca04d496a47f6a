use unicode_segmentation::UnicodeSegmentation;

/// Lowercased word tokens; identifiers are split on `_` and `.` so
/// `orders.customer_id` yields `orders`, `customer` and `id`
pub fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words()
        .flat_map(|word| word.split(|c: char| !c.is_alphanumeric()))
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Crude plural folding so `orders` and `order` land on the same token
pub fn fold_plural(token: &str) -> &str {
    if token.len() > 3 && token.ends_with('s') && !token.ends_with("ss") {
        token.strip_suffix('s').unwrap_or(token)
    } else {
        token
    }
}

/// 64-bit digest that is stable across processes and platforms
pub fn stable_hash(bytes: &[u8]) -> u64 {
    let digest = blake3::hash(bytes);
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_splits_identifiers() {
        assert_eq!(
            tokenize("Who placed order_items.customer_id?"),
            vec!["who", "placed", "order", "items", "customer", "id"]
        );
    }

    #[test]
    fn plural_folding() {
        assert_eq!(fold_plural("orders"), "order");
        assert_eq!(fold_plural("address"), "address");
        assert_eq!(fold_plural("ids"), "ids");
    }

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_hash(b"orders"), stable_hash(b"orders"));
        assert_ne!(stable_hash(b"orders"), stable_hash(b"customers"));
    }
}
