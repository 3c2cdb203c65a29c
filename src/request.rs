//! The [LoadRequest] describes one load: what to fetch, how to decode it, what to do to it afterwards and who to tell.
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::*;

/// Stands in for the sample size when a request has no decode options.  Matches the default sample size, since both
/// decode the same pixels.
const NO_OPTIONS_SAMPLE_TOKEN: u32 = 1;

#[derive(Clone)]
pub struct LoadRequest {
    uri: String,
    options: Option<DecodeOptions>,
    padding: Option<PaddingSink>,
    transforms: Vec<Arc<dyn Transform>>,
    callback: Option<Arc<dyn LoadCallback>>,
}

impl LoadRequest {
    pub fn new(uri: impl Into<String>) -> LoadRequest {
        LoadRequest {
            uri: uri.into(),
            options: None,
            padding: None,
            transforms: vec![],
            callback: None,
        }
    }

    pub fn with_options(mut self, options: DecodeOptions) -> LoadRequest {
        self.options = Some(options);
        self
    }

    pub fn with_padding_sink(mut self, sink: PaddingSink) -> LoadRequest {
        self.padding = Some(sink);
        self
    }

    /// Append a transform.  Transforms run in the order they were added.
    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> LoadRequest {
        self.transforms.push(transform);
        self
    }

    pub fn with_callback(mut self, callback: Arc<dyn LoadCallback>) -> LoadRequest {
        self.callback = Some(callback);
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn options(&self) -> Option<&DecodeOptions> {
        self.options.as_ref()
    }

    pub fn padding_sink(&self) -> Option<&PaddingSink> {
        self.padding.as_ref()
    }

    pub fn transforms(&self) -> &[Arc<dyn Transform>] {
        &self.transforms
    }

    pub fn callback(&self) -> Option<&Arc<dyn LoadCallback>> {
        self.callback.as_ref()
    }

    pub fn is_bounds_only(&self) -> bool {
        self.options.map_or(false, |o| o.bounds_only)
    }

    /// The key this request's result is cached under.
    ///
    /// The URI, the sample size and the ordered transform ids all feed the key, so two requests agreeing on all three
    /// share cache entries and a difference in any one of them gives a different key.  Every field is
    /// length-prefixed before hashing so that no two field sequences can run together into the same byte stream.
    pub fn cache_key(&self) -> String {
        let sample = self
            .options
            .map_or(NO_OPTIONS_SAMPLE_TOKEN, |o| o.effective_sample_size());

        let mut hasher = Sha256::new();
        hash_field(&mut hasher, self.uri.as_bytes());
        hash_field(&mut hasher, &sample.to_le_bytes());
        hasher.update((self.transforms.len() as u64).to_le_bytes());
        for t in &self.transforms {
            hash_field(&mut hasher, t.id().as_bytes());
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl fmt::Debug for LoadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadRequest")
            .field("uri", &self.uri)
            .field("options", &self.options)
            .field(
                "transforms",
                &self.transforms.iter().map(|t| t.id()).collect::<Vec<_>>(),
            )
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Named(String);

    impl Transform for Named {
        fn id(&self) -> String {
            self.0.clone()
        }

        fn apply(&self, input: Bitmap) -> Result<Bitmap, LoadError> {
            Ok(input)
        }
    }

    fn request(uri: &str, sample: Option<u32>, ids: &[String]) -> LoadRequest {
        let mut r = LoadRequest::new(uri);
        if let Some(s) = sample {
            r = r.with_options(DecodeOptions::sampled(s));
        }
        for id in ids {
            r = r.with_transform(Arc::new(Named(id.clone())));
        }
        r
    }

    #[test]
    fn key_is_fixed_width_hex() {
        let key = LoadRequest::new("http://x/img.png").cache_key();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn callback_and_padding_do_not_affect_key() {
        let plain = LoadRequest::new("http://x/img.png");
        let sink = plain.clone().with_padding_sink(PaddingSink::new());
        assert_eq!(plain.cache_key(), sink.cache_key());
    }

    #[test]
    fn missing_options_match_unit_sample() {
        assert_eq!(
            request("u", None, &[]).cache_key(),
            request("u", Some(1), &[]).cache_key()
        );
    }

    #[test]
    fn transform_order_matters() {
        let a = request("u", None, &["r200x200".into(), "ro90".into()]);
        let b = request("u", None, &["ro90".into(), "r200x200".into()]);
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn transform_ids_do_not_run_together() {
        let a = request("u", None, &["ab".into(), "c".into()]);
        let b = request("u", None, &["a".into(), "bc".into()]);
        assert_ne!(a.cache_key(), b.cache_key());
    }

    proptest! {
        #[test]
        fn equal_inputs_give_equal_keys(
            uri in "[a-z:/.]{1,40}",
            sample in 1..16u32,
            ids in prop::collection::vec("[a-z0-9]{1,8}", 0..4),
        ) {
            prop_assert_eq!(
                request(&uri, Some(sample), &ids).cache_key(),
                request(&uri, Some(sample), &ids).cache_key()
            );
        }

        #[test]
        fn any_changed_input_changes_the_key(
            uri in "[a-z:/.]{1,40}",
            other_uri in "[a-z:/.]{1,40}",
            sample in 1..16u32,
            other_sample in 1..16u32,
            ids in prop::collection::vec("[a-z0-9]{1,8}", 0..4),
            other_ids in prop::collection::vec("[a-z0-9]{1,8}", 0..4),
        ) {
            let base = request(&uri, Some(sample), &ids).cache_key();
            if uri != other_uri {
                prop_assert_ne!(&base, &request(&other_uri, Some(sample), &ids).cache_key());
            }
            if sample != other_sample {
                prop_assert_ne!(&base, &request(&uri, Some(other_sample), &ids).cache_key());
            }
            if ids != other_ids {
                prop_assert_ne!(&base, &request(&uri, Some(sample), &other_ids).cache_key());
            }
        }
    }
}
