#![no_main]

use libfuzzer_sys::fuzz_target;
use telebatch_core::reading::Reading;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let Ok(reading) = Reading::from_json(value) else {
        return;
    };

    // Anything accepted must pass validation and survive the batch format.
    assert!(reading.validate().is_ok());
    assert!(!reading.device_id.trim().is_empty());
    let bytes = telebatch_core::reading::encode_batch(std::slice::from_ref(&reading))
        .expect("accepted reading encodes");
    let decoded = telebatch_core::reading::decode_batch(&bytes).expect("encoded batch decodes");
    assert_eq!(decoded.len(), 1);
    assert_eq!(decoded[0].device_id, reading.device_id);
});
