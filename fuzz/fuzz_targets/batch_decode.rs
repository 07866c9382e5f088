#![no_main]

use libfuzzer_sys::fuzz_target;
use telebatch_core::reading::{decode_batch, encode_batch};
use telebatch_core::storage::ContentId;

fuzz_target!(|data: &[u8]| {
    let id = ContentId::for_bytes(data);
    assert!(id.is_sha256());

    let Ok(batch) = decode_batch(data) else {
        return;
    };
    let bytes = encode_batch(&batch).expect("decoded batch re-encodes");
    let again = decode_batch(&bytes).expect("re-encoded batch decodes");
    assert_eq!(again.len(), batch.len());
});
