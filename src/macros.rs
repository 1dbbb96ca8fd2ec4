// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Verify that a box parser consumed exactly the bytes its header promised.
/// Catches parser bugs (and malformed inputs with bogus internal box sizes)
/// before they're silently papered over by `Take`.
macro_rules! check_parser_state {
    ($content:expr) => {
        if $content.limit() > 0 {
            return Err($crate::Error::InvalidData(
                "unread box content or bad parser sync",
            ));
        }
    };
}
