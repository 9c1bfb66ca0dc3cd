use std::sync::Arc;

use anyhow::Result;

/// Maps text to a fixed-length vector.
///
/// Implementations must be deterministic for identical text and return the
/// same dimensionality for every call. Vectors need not be unit length.
/// Calls may block for a long time; the engine never holds a lock across one.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

impl EmbeddingProvider for Box<dyn EmbeddingProvider> {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }
}

impl<P: EmbeddingProvider + ?Sized> EmbeddingProvider for Arc<P> {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (**self).embed(text)
    }
}

/// Bag-of-words provider: FNV-1a token hashing into `dim` buckets, L2-normalized.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dim: usize,
}

impl HashEmbeddingProvider {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }
}

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self {
            dim: crate::config::DEFAULT_EMBEDDING_DIM,
        }
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; self.dim];

        for token in text
            .to_ascii_lowercase()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut h: u64 = 1469598103934665603;
            for b in token.as_bytes() {
                h ^= *b as u64;
                h = h.wrapping_mul(1099511628211);
            }
            let idx = (h % self.dim as u64) as usize;
            v[idx] += 1.0;
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }

        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embedding_is_deterministic_and_normalized() {
        let p = HashEmbeddingProvider::new(64);
        let a = p.embed("How do I reset my password?").unwrap();
        let b = p.embed("how do i RESET my password").unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        let norm = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn text_without_tokens_embeds_to_zero_vector() {
        let p = HashEmbeddingProvider::new(16);
        let v = p.embed("?!  ...").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn dimension_has_a_floor() {
        assert_eq!(HashEmbeddingProvider::new(2).dim(), 8);
    }

    #[test]
    fn boxed_and_shared_providers_delegate() {
        let boxed: Box<dyn EmbeddingProvider> = Box::new(HashEmbeddingProvider::new(32));
        let shared = Arc::new(HashEmbeddingProvider::new(32));
        assert_eq!(boxed.embed("hours").unwrap(), shared.embed("hours").unwrap());
    }
}
