//! # List of email headers the pipeline cares about.

use mailparse::{MailHeader, MailHeaderMap};
use strum_macros::Display;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
#[strum(serialize_all = "kebab_case")]
#[allow(dead_code)]
pub enum HeaderDef {
    MessageId,
    Subject,
    Date,
    From_,
    Sender,
    To,
    Cc,
    Bcc,
    ReturnPath,

    /// Extra destination headers some MTAs add when forwarding;
    /// merged into the recipient list alongside To/Cc.
    DeliveredTo,
    XForwardedTo,

    InReplyTo,
    References,
    Precedence,

    /// RFC 3834 marker for vacation responders and their kin.
    AutoSubmitted,
    XAutoResponseSuppress,
    XAutoreply,
    ListId,
    ListUnsubscribe,

    /// Set by some MTAs on non-standard delivery failure reports.
    XFailedRecipients,

    _TestHeader,
}

impl HeaderDef {
    /// Returns the header name as it appears on the wire.
    pub fn get_headername(&self) -> String {
        self.to_string()
    }
}

/// Typed access to a parsed header list.
pub(crate) trait HeaderDefMap {
    fn get_header_value(&self, headerdef: HeaderDef) -> Option<String>;
}

impl HeaderDefMap for [MailHeader<'_>] {
    fn get_header_value(&self, headerdef: HeaderDef) -> Option<String> {
        self.get_first_value(&headerdef.get_headername())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Test that kebab_case serialization works as expected
    fn kebab_test() {
        assert_eq!(HeaderDef::From_.to_string(), "from");
        assert_eq!(HeaderDef::XForwardedTo.to_string(), "x-forwarded-to");
        assert_eq!(HeaderDef::_TestHeader.to_string(), "test-header");
    }

    #[test]
    fn test_get_header_value_case_insensitive() {
        let (headers, _) =
            mailparse::parse_headers(b"fRoM: Bob\nDelivered-To: inbox@example.org\n\n").unwrap();
        assert_eq!(
            headers.get_header_value(HeaderDef::From_),
            Some("Bob".to_string())
        );
        assert_eq!(
            headers.get_header_value(HeaderDef::DeliveredTo),
            Some("inbox@example.org".to_string())
        );
        assert_eq!(headers.get_header_value(HeaderDef::Subject), None);
    }
}
