//! # Attachment handling.
//!
//! Uploads each MIME attachment through the storage collaborator and
//! rewrites the body markup: inline image placeholders are substituted in
//! place, everything else is appended. A failing upload only loses that
//! one attachment, never the message.

use humansize::{format_size, DECIMAL};

use crate::context::Context;
use crate::forum::User;
use crate::mimeparser::Attachment;

/// Uploads `attachments` and returns the body with markup for them.
pub async fn add_attachments(
    context: &Context,
    user: &User,
    attachments: &[Attachment],
    body: &str,
    for_group_message: bool,
) -> String {
    let mut body = body.to_string();
    let mut appended = String::new();

    for attachment in attachments {
        let filename = sanitize_filename::sanitize(&attachment.filename);
        let upload = match context
            .uploader
            .upload(user.id, &filename, &attachment.data, for_group_message)
            .await
        {
            Ok(upload) => upload,
            Err(err) => {
                warn!(context, "upload of {filename:?} failed, skipping: {err:#}");
                continue;
            }
        };

        if attachment.is_image() {
            let markup = format!("![{}]({})", filename, upload.url);
            if substitute_placeholder(&mut body, &attachment.filename, &markup) {
                continue;
            }
            appended.push_str(&format!("\n\n{markup}"));
        } else {
            appended.push_str(&format!(
                "\n\n[{}|attachment]({}) ({})",
                filename,
                upload.url,
                format_size(attachment.data.len(), DECIMAL)
            ));
        }
    }

    body.push_str(&appended);
    body
}

/// Replaces the first `[image: <name>]` or `[image: <name> <n>]`
/// placeholder naming this file. Mail clients put these placeholders into
/// the text part where the image sat in the HTML part.
fn substitute_placeholder(body: &mut String, filename: &str, markup: &str) -> bool {
    let stem = filename.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(filename);
    for name in [filename, stem] {
        let mut search = 0;
        while let Some(found) = body[search..].find("[image: ") {
            let start = search + found;
            let Some(rel_end) = body[start..].find(']') else {
                break;
            };
            let end = start + rel_end;
            let label = &body[start + "[image: ".len()..end];
            // Trailing counter as in "[image: photo.png 2]".
            let label_name = label
                .rsplit_once(' ')
                .filter(|(_, n)| n.chars().all(|c| c.is_ascii_digit()))
                .map(|(name, _)| name)
                .unwrap_or(label);
            if label_name.trim() == name {
                body.replace_range(start..=end, markup);
                return true;
            }
            search = end + 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mimeparser::Attachment;
    use crate::test_utils::TestContext;

    fn image(filename: &str) -> Attachment {
        Attachment {
            filename: filename.to_string(),
            mime_type: "image/png".to_string(),
            data: vec![0x89, 0x50, 0x4e, 0x47],
        }
    }

    #[test]
    fn test_substitute_placeholder() {
        let mut body = "before [image: photo.png] after".to_string();
        assert!(substitute_placeholder(&mut body, "photo.png", "![photo.png](/u/1)"));
        assert_eq!(body, "before ![photo.png](/u/1) after");

        let mut body = "x [image: chart 2] y".to_string();
        assert!(substitute_placeholder(&mut body, "chart.png", "![c](/u/2)"));
        assert_eq!(body, "x ![c](/u/2) y");

        let mut body = "no placeholder".to_string();
        assert!(!substitute_placeholder(&mut body, "photo.png", "![p](/u/3)"));
    }

    #[tokio::test]
    async fn test_inline_image_is_substituted() {
        let t = TestContext::new().await;
        let user = t.forum.add_user("bob@example.com", "bob", 2);
        let body = add_attachments(
            &t.ctx,
            &user,
            &[image("photo.png")],
            "look: [image: photo.png] done",
            false,
        )
        .await;
        assert!(body.starts_with("look: !["));
        assert!(!body.contains("[image: photo.png]"));
    }

    #[tokio::test]
    async fn test_non_image_is_appended_with_size() {
        let t = TestContext::new().await;
        let user = t.forum.add_user("bob@example.com", "bob", 2);
        let attachment = Attachment {
            filename: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            data: vec![0; 2_000],
        };
        let body = add_attachments(&t.ctx, &user, &[attachment], "see attached", false).await;
        assert!(body.contains("[report.pdf|attachment]("));
        assert!(body.contains("(2 kB)"));
    }

    #[tokio::test]
    async fn test_failed_upload_is_skipped() {
        let t = TestContext::new().await;
        let user = t.forum.add_user("bob@example.com", "bob", 2);
        t.uploader.fail_next();
        let body = add_attachments(
            &t.ctx,
            &user,
            &[image("a.png"), image("b.png")],
            "text",
            false,
        )
        .await;
        // First upload failed and is simply absent.
        assert!(!body.contains("a.png"));
        assert!(body.contains("b.png"));
    }
}
