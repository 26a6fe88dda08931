//! Multi-recipient delivery
//!
//! A [`Delivery`] accumulates recipients and a message body, then inserts
//! one message row per recipient in a single transaction: either every
//! recipient gets the message or none does. The body is parsed once and,
//! with an external store configured, written out once; all recipient rows
//! share the object through its reference count.

use chrono::{DateTime, Utc};
use rusqlite::TransactionBehavior;

use crate::error::{Error, Result, SqlCtx};
use crate::models::{SpecialUse, INBOX_NAME};
use crate::store::Store;
use crate::updates::Update;

enum Target {
    Mailbox(String),
    SpecialUse(SpecialUse),
}

/// An in-progress delivery. Dropping it without committing discards any
/// staged external object.
pub struct Delivery<'a> {
    store: &'a Store,
    rcpts: Vec<String>,
    target: Target,
    flags: Vec<String>,
    internal_date: Option<DateTime<Utc>>,
    staged: Option<crate::store::StagedBody>,
    committed: bool,
}

impl Store {
    /// Start a delivery targeting INBOX.
    pub fn delivery(&self) -> Delivery<'_> {
        Delivery {
            store: self,
            rcpts: Vec::new(),
            target: Target::Mailbox(INBOX_NAME.to_string()),
            flags: Vec::new(),
            internal_date: None,
            staged: None,
            committed: false,
        }
    }
}

impl Delivery<'_> {
    /// Add a recipient. The account is resolved eagerly so an unknown
    /// user is reported per recipient, before anything is staged.
    pub fn add_rcpt(&mut self, username: &str) -> Result<()> {
        if !self.store.user_exists(username)? {
            return Err(Error::UserNotFound(username.to_string()));
        }
        if !self.rcpts.iter().any(|r| r.eq_ignore_ascii_case(username)) {
            self.rcpts.push(username.to_string());
        }
        Ok(())
    }

    /// Deliver into a named mailbox instead of INBOX.
    pub fn mailbox(&mut self, name: &str) -> &mut Self {
        self.target = Target::Mailbox(name.to_string());
        self
    }

    /// Deliver into the recipient's mailbox carrying a special-use role.
    /// Recipients without one get it created under its conventional name.
    pub fn special_use(&mut self, role: SpecialUse) -> &mut Self {
        self.target = Target::SpecialUse(role);
        self
    }

    /// Initial flags for the delivered message. `\Recent` is implied.
    pub fn flags(&mut self, flags: &[&str]) -> &mut Self {
        self.flags = flags.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Arrival timestamp; defaults to commit time.
    pub fn internal_date(&mut self, date: DateTime<Utc>) -> &mut Self {
        self.internal_date = Some(date);
        self
    }

    /// Stage the message body: parse it and, when an external store is
    /// configured, write the object out. Must be called exactly once
    /// before [`Delivery::commit`].
    pub fn body(&mut self, raw: &[u8]) -> Result<()> {
        if let Some(limit) = self.store.config.max_msg_size {
            if raw.len() as u64 > limit as u64 {
                return Err(Error::SizeLimitExceeded {
                    size: raw.len() as u64,
                    limit: limit as u64,
                });
            }
        }
        self.staged = Some(self.store.stage_body(raw)?);
        Ok(())
    }

    /// Insert the message for every recipient in one transaction and
    /// publish the mailbox notifications. A recipient account that
    /// vanished since [`Delivery::add_rcpt`] aborts the whole delivery
    /// with [`Error::Interrupted`].
    pub fn commit(mut self) -> Result<()> {
        let staged = self
            .staged
            .as_ref()
            .ok_or_else(|| Error::BadMessage("delivery committed without a body".to_string()))?;
        let internal_date = self.internal_date.unwrap_or_else(Utc::now);
        let flags: Vec<&str> = self.flags.iter().map(|f| f.as_str()).collect();
        let size = (staged.header.len() + staged.body_len) as u64;

        let delivered: Vec<(String, String)> = {
            let mut conn = self.store.conn.lock().unwrap();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .ctx("delivery")?;

            let mut targets = Vec::with_capacity(self.rcpts.len());
            for rcpt in &self.rcpts {
                let user_id = match crate::store::user_id_by_name(&tx, rcpt) {
                    Ok(id) => id,
                    // Validated at add_rcpt time; gone now
                    Err(Error::UserNotFound(_)) => return Err(Error::Interrupted),
                    Err(e) => return Err(e),
                };
                let mailbox_name = match &self.target {
                    Target::Mailbox(name) => {
                        // Explicit targets are created on demand, parents
                        // included.
                        match crate::store::mailbox_id_by_name(&tx, user_id, name) {
                            Ok(_) => {}
                            Err(Error::MailboxNotFound(_)) => {
                                self.store.ensure_parents(&tx, user_id, name)?;
                                self.store.insert_mailbox_row(&tx, user_id, name, None)?;
                            }
                            Err(e) => return Err(e),
                        }
                        name.clone()
                    }
                    Target::SpecialUse(role) => {
                        match self.store.special_use_name(&tx, user_id, *role)? {
                            Some(name) => name,
                            None => {
                                let name = role.default_mailbox_name().to_string();
                                match self
                                    .store
                                    .insert_mailbox_row(&tx, user_id, &name, Some(*role))
                                {
                                    // A plain mailbox with that name exists;
                                    // deliver into it as-is.
                                    Ok(_) | Err(Error::MailboxAlreadyExists(_)) => {}
                                    Err(e) => return Err(e),
                                }
                                name
                            }
                        }
                    }
                };
                let mailbox_id = match crate::store::mailbox_id_by_name(
                    &tx,
                    user_id,
                    &mailbox_name,
                ) {
                    Ok(id) => id,
                    Err(Error::MailboxNotFound(_))
                        if mailbox_name.eq_ignore_ascii_case(INBOX_NAME) =>
                    {
                        // Every account has an INBOX; losing it mid-flight
                        // means the account itself is going away.
                        return Err(Error::Interrupted);
                    }
                    Err(e) => return Err(e),
                };
                if let Some(limit) =
                    self.store.effective_size_limit(&tx, user_id, mailbox_id)?
                {
                    if size > limit as u64 {
                        return Err(Error::SizeLimitExceeded {
                            size,
                            limit: limit as u64,
                        });
                    }
                }
                targets.push((rcpt.clone(), mailbox_name, mailbox_id));
            }

            for (_, _, mailbox_id) in &targets {
                let uid = crate::store::allocate_uids(&tx, *mailbox_id, 1)?;
                self.store.insert_message_row(
                    &tx,
                    *mailbox_id,
                    uid,
                    staged,
                    internal_date,
                    &flags,
                )?;
            }
            if let Some(key) = &staged.ext_key {
                self.store.insert_ext_key(&tx, key, targets.len() as u32)?;
            }

            tx.commit().ctx("delivery")?;
            targets
                .into_iter()
                .map(|(user, mailbox, _)| (user, mailbox))
                .collect()
        };

        self.committed = true;
        self.store.publish(
            delivered
                .into_iter()
                .map(|(user, mailbox)| Update::Mailbox { user, mailbox })
                .collect(),
        );
        Ok(())
    }

    /// Explicitly drop the delivery and its staged object.
    pub fn abort(self) {}
}

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        if !self.committed {
            if let Some(staged) = &self.staged {
                self.store.discard_staged(staged);
            }
        }
    }
}
