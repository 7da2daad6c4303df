// Copyright 2025 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Canonical JSON as defined in the [Matrix spec appendices], used as the
//! input for signing.
//!
//! [Matrix spec appendices]: https://spec.matrix.org/latest/appendices/#canonical-json

use serde_json::Value;

/// Serialize a JSON value into its canonical form.
///
/// Object members are sorted by key byte-wise, there is no insignificant
/// whitespace, strings stay UTF-8 (escaping only what JSON requires) and
/// scalars use their minimal JSON presentation. Integers round-trip
/// exactly; the spec restricts numbers to the integer range, so no float
/// normalization is attempted beyond serde_json's shortest form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(object) => {
            out.push('{');
            let mut keys: Vec<&String> = object.keys().collect();
            keys.sort_unstable();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&object[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(array) => {
            out.push('[');
            for (i, element) in array.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(element, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        // Numbers, booleans and null already have a unique minimal form.
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json escapes quotes, backslashes and control characters and
    // passes other UTF-8 through unchanged, which is exactly the canonical
    // string form.
    out.push_str(&Value::String(s.to_owned()).to_string());
}

/// Convert a JSON web signature (JWS) style base64 string to standard
/// base64.
///
/// `-`/`_` become `+`/`/` and the result is padded with `=` to a multiple
/// of four. The input alphabet is not validated.
pub fn jws_to_base64(input: &str) -> String {
    let mut out: String = input
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();
    while out.len() % 4 != 0 {
        out.push('=');
    }
    out
}
