//! Escrow entry names
//!
//! A share set is addressed by `file + owner + hex(SHA-256(file + owner))`
//! with punctuation the escrow transport cannot carry replaced.

use ring::digest;

/// Deterministic, escaped entry name for one file and owner
pub fn entry_name(file_id: &str, owner: &str) -> String {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(file_id.as_bytes());
    ctx.update(owner.as_bytes());
    let hash = hex::encode(ctx.finish());

    format!("{}{}{}", file_id, owner, hash)
        .chars()
        .map(escape_char)
        .collect()
}

fn escape_char(c: char) -> char {
    match c {
        ',' | '%' | '*' | ')' | '!' | '\\' | ']' => '#',
        ' ' | '^' | '(' | '+' | '?' | '[' | '~' => '_',
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = entry_name("3f2a", "alice");
        let b = entry_name("3f2a", "alice");
        assert_eq!(a, b);
        assert_ne!(a, entry_name("3f2a", "bob"));
        assert_ne!(a, entry_name("3f2b", "alice"));
    }

    #[test]
    fn test_layout() {
        let name = entry_name("file", "user");
        assert!(name.starts_with("fileuser"));
        // 64 hex digits of SHA-256
        assert_eq!(name.len(), "fileuser".len() + 64);
    }

    #[test]
    fn test_escaping() {
        let name = entry_name("a,b c%d^e*f(g)h+i!j?k\\l[m]n~o", "CN=x, O=y");
        for c in [',', ' ', '%', '^', '*', '(', ')', '+', '!', '?', '\\', '[', ']', '~'] {
            assert!(!name.contains(c), "unescaped {:?} in {}", c, name);
        }
        assert!(name.starts_with("a#b_c#d_e#f_g#h_i#j_k#l_m#n_oCN=x#_O=y"));
    }
}
