//! Native text encoding primitives backing `TextEncoder`/`TextDecoder`.

use rquickjs::{Ctx, Exception, Result};

#[rquickjs::module(rename_vars = "camelCase")]
#[allow(clippy::module_inception)]
pub mod native_encoding {
    use super::*;

    #[rquickjs::function]
    pub fn utf8_encode(text: String) -> Vec<u8> {
        text.into_bytes()
    }

    #[rquickjs::function]
    pub fn utf8_decode(ctx: Ctx<'_>, bytes: Vec<u8>, fatal: bool) -> Result<String> {
        if fatal {
            String::from_utf8(bytes).map_err(|e| Exception::throw_type(&ctx, &e.to_string()))
        } else {
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let bytes = "héllo".to_string().into_bytes();
        assert_eq!(String::from_utf8(bytes.clone()).unwrap(), "héllo");
        let _ = bytes;
    }
}
