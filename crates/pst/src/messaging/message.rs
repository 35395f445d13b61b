//! ## [Messages](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/1042af37-aaa4-4edc-bffd-90a1ede24188)
//!
//! A message is one node: its PC in the data tree, and its recipient and
//! attachment tables (plus the attachment objects themselves) as
//! subnodes.

use std::{io, sync::Arc};

use super::{attachment::Attachment, *};
use crate::{
    ltp::{prop_context::*, table_context::*},
    ndb::{database::DbContext, node::Node, node_id::*},
    PstFile,
};

/// One decoded recipient-table row.
#[derive(Clone, Debug, PartialEq)]
pub struct Recipient {
    pub row_id: u32,
    pub name: String,
    pub recipient_type: i32,
    pub address_type: String,
    pub email_address: String,
}

pub struct Message<Pst: PstFile> {
    db: Arc<DbContext<Pst>>,
    properties: PropertyContext<Pst>,
}

impl<Pst: PstFile> Message<Pst> {
    pub fn open(db: Arc<DbContext<Pst>>, id: NodeId) -> io::Result<Self> {
        let id_type = id.id_type().map_err(io::Error::from)?;
        if !matches!(
            id_type,
            NodeIdType::NormalMessage | NodeIdType::AssociatedMessage
        ) {
            return Err(MessagingError::InvalidMessageNodeIdType(id_type).into());
        }

        let node = db.lookup_node(id)?;
        let properties = db.with_store(|store| PropertyContext::open(store, node))?;
        Ok(Self { db, properties })
    }

    /// Create the message node with its PC and empty recipient and
    /// attachment tables.
    pub(crate) fn create(
        db: &Arc<DbContext<Pst>>,
        id: NodeId,
        parent: NodeId,
        message_class: &str,
    ) -> io::Result<()> {
        let node = db.create_node(id, parent)?;
        db.with_store(|store| {
            let mut properties = PropertyContext::create(store, node)?;
            properties.write_prop(
                store,
                PR_MESSAGE_CLASS,
                PropertyValue::String8(message_class.bytes().collect()),
            )?;
            properties.write_prop(store, PR_MESSAGE_SIZE, PropertyValue::Integer32(0))?;

            for (table_id, columns) in [
                (NID_RECIPIENT_TABLE, RECIPIENT_TABLE_COLUMNS),
                (NID_ATTACHMENT_TABLE, ATTACHMENT_TABLE_COLUMNS),
            ] {
                let table_node = properties.node_mut().create_subnode(store, table_id)?;
                let mut table = TableContext::create(store, table_node, columns)?;
                table.save_subnode(store, properties.node_mut())?;
            }

            properties.save(store)
        })
    }

    pub fn id(&self) -> NodeId {
        self.properties.node().id()
    }

    pub fn parent_id(&self) -> NodeId {
        self.properties.node().parent_id()
    }

    pub(crate) fn db(&self) -> &Arc<DbContext<Pst>> {
        &self.db
    }

    pub(crate) fn container_node_mut(&mut self) -> &mut Node<Pst> {
        self.properties.node_mut()
    }

    pub(crate) fn container_node(&self) -> &Node<Pst> {
        self.properties.node()
    }

    fn read_string(&self, prop_id: u16) -> io::Result<String> {
        self.db
            .with_store(|store| match self.properties.read_prop(store, prop_id)? {
                PropertyValue::Unicode(text) => Ok(text),
                PropertyValue::String8(bytes) => Ok(bytes.iter().map(|&b| b as char).collect()),
                _ => Err(MessagingError::UnexpectedPropertyValue(prop_id).into()),
            })
    }

    pub fn message_class(&self) -> io::Result<String> {
        self.read_string(PR_MESSAGE_CLASS)
    }

    /// The subject, with the length-prefix convention (a leading 0x01
    /// control pair) stripped.
    pub fn subject(&self) -> io::Result<String> {
        let raw = self.read_string(PR_SUBJECT)?;
        let mut chars = raw.chars();
        if chars.next() == Some('\u{1}') {
            chars.next();
            Ok(chars.collect())
        } else {
            Ok(raw)
        }
    }

    pub fn set_subject(&mut self, subject: &str) -> io::Result<()> {
        self.db.with_store(|store| {
            self.properties.write_prop(
                store,
                PR_SUBJECT,
                PropertyValue::Unicode(subject.to_string()),
            )
        })
    }

    pub fn body(&self) -> io::Result<String> {
        self.read_string(PR_BODY)
    }

    pub fn set_body(&mut self, body: &str) -> io::Result<()> {
        self.db.with_store(|store| {
            self.properties
                .write_prop(store, PR_BODY, PropertyValue::Unicode(body.to_string()))
        })
    }

    pub fn html_body(&self) -> io::Result<Vec<u8>> {
        self.db
            .with_store(|store| match self.properties.read_prop(store, PR_HTML)? {
                PropertyValue::Binary(bytes) => Ok(bytes),
                _ => Err(MessagingError::UnexpectedPropertyValue(PR_HTML).into()),
            })
    }

    pub fn set_html_body(&mut self, html: &[u8]) -> io::Result<()> {
        self.db.with_store(|store| {
            self.properties
                .write_prop(store, PR_HTML, PropertyValue::Binary(html.to_vec()))
        })
    }

    pub fn message_size(&self) -> io::Result<i32> {
        self.db
            .with_store(|store| match self.properties.read_prop(store, PR_MESSAGE_SIZE)? {
                PropertyValue::Integer32(size) => Ok(size),
                _ => Err(MessagingError::UnexpectedPropertyValue(PR_MESSAGE_SIZE).into()),
            })
    }

    pub fn set_message_size(&mut self, size: i32) -> io::Result<()> {
        self.db.with_store(|store| {
            self.properties
                .write_prop(store, PR_MESSAGE_SIZE, PropertyValue::Integer32(size))
        })
    }

    fn open_subnode_table(&self, id: NodeId) -> io::Result<TableContext<Pst>> {
        self.db.with_store(|store| {
            let node = self.properties.node().lookup_subnode(store, id)?;
            TableContext::open(store, node)
        })
    }

    pub fn recipient_table(&self) -> io::Result<TableContext<Pst>> {
        self.open_subnode_table(NID_RECIPIENT_TABLE)
    }

    pub fn attachment_table(&self) -> io::Result<TableContext<Pst>> {
        self.open_subnode_table(NID_ATTACHMENT_TABLE)
    }

    pub fn recipient_count(&self) -> io::Result<usize> {
        let table = self.recipient_table()?;
        self.db.with_store(|store| table.row_count(store))
    }

    /// Snapshot of the recipient rows.
    pub fn recipients(&self) -> io::Result<Vec<Recipient>> {
        let table = self.recipient_table()?;
        self.db.with_store(|store| {
            let mut out = Vec::new();
            for row in table.rows(store)? {
                let name = match table.read_cell(store, row.position, PR_DISPLAY_NAME)? {
                    PropertyValue::Unicode(text) => text,
                    _ => String::new(),
                };
                let recipient_type =
                    match table.read_cell(store, row.position, PR_RECIPIENT_TYPE)? {
                        PropertyValue::Integer32(value) => value,
                        _ => 0,
                    };
                let address_type = match table.read_cell(store, row.position, PR_ADDRTYPE)? {
                    PropertyValue::Unicode(text) => text,
                    _ => String::new(),
                };
                let email_address =
                    match table.read_cell(store, row.position, PR_EMAIL_ADDRESS)? {
                        PropertyValue::Unicode(text) => text,
                        _ => String::new(),
                    };
                out.push(Recipient {
                    row_id: row.row_id,
                    name,
                    recipient_type,
                    address_type,
                    email_address,
                });
            }
            Ok(out)
        })
    }

    /// Append a recipient row; returns its row id.
    pub fn add_recipient(
        &mut self,
        name: &str,
        recipient_type: i32,
        address_type: &str,
        email_address: &str,
    ) -> io::Result<u32> {
        let mut table = self.recipient_table()?;
        let row_id = self
            .db
            .with_store(|store| Ok(table.rows(store)?.iter().map(|r| r.row_id).max()))?
            .map(|id| id + 1)
            .unwrap_or(1);

        self.db.with_store(|store| {
            let position = table.add_row(store, row_id)?;
            table.set_cell(
                store,
                position,
                PR_DISPLAY_NAME,
                PropertyValue::Unicode(name.to_string()),
            )?;
            table.set_cell(
                store,
                position,
                PR_RECIPIENT_TYPE,
                PropertyValue::Integer32(recipient_type),
            )?;
            table.set_cell(
                store,
                position,
                PR_ADDRTYPE,
                PropertyValue::Unicode(address_type.to_string()),
            )?;
            table.set_cell(
                store,
                position,
                PR_EMAIL_ADDRESS,
                PropertyValue::Unicode(email_address.to_string()),
            )?;
            table.save_subnode(store, self.properties.node_mut())
        })?;
        Ok(row_id)
    }

    /// Attachment subnode ids, in attachment-table order.
    pub fn attachments(&self) -> io::Result<Vec<NodeId>> {
        let table = self.attachment_table()?;
        self.db.with_store(|store| {
            Ok(table
                .rows(store)?
                .into_iter()
                .map(|row| NodeId::from(row.row_id))
                .collect())
        })
    }

    pub fn attachment_count(&self) -> io::Result<usize> {
        Ok(self.attachments()?.len())
    }

    pub fn open_attachment(&self, id: NodeId) -> io::Result<Attachment<Pst>> {
        Attachment::open(&self.db, self, id)
    }

    /// Create an attachment object and its table row.
    pub fn create_attachment(
        &mut self,
        filename: &str,
        method: i32,
        data: &[u8],
        declared_size: i32,
    ) -> io::Result<Attachment<Pst>> {
        let id = self.db.alloc_nid(NodeIdType::Attachment)?;
        Attachment::create(self, id, filename, method, data, declared_size)?;

        let mut table = self.attachment_table()?;
        self.db.with_store(|store| {
            let position = table.add_row(store, u32::from(id))?;
            table.set_cell(
                store,
                position,
                PR_ATTACH_FILENAME,
                PropertyValue::Unicode(filename.to_string()),
            )?;
            table.set_cell(
                store,
                position,
                PR_ATTACH_METHOD,
                PropertyValue::Integer32(method),
            )?;
            table.set_cell(
                store,
                position,
                PR_ATTACH_SIZE,
                PropertyValue::Integer32(declared_size),
            )?;
            table.save_subnode(store, self.properties.node_mut())
        })?;

        self.open_attachment(id)
    }

    /// Queue pending changes and refresh this message's row in the parent
    /// folder's contents table.
    pub fn save(&mut self) -> io::Result<()> {
        self.db.with_store(|store| self.properties.save(store))?;

        let subject = self.subject()?;
        let size = self.message_size()?;
        let parent = self.parent_id();
        let id = self.id();

        let contents_nid =
            NodeId::new(NodeIdType::ContentsTable, parent.index()).map_err(io::Error::from)?;
        let node = self.db.lookup_node(contents_nid)?;
        self.db.with_store(|store| {
            let mut contents = TableContext::open(store, node)?;
            let position = contents.lookup_row(store, u32::from(id))?;
            contents.set_cell(store, position, PR_SUBJECT, PropertyValue::Unicode(subject))?;
            contents.set_cell(
                store,
                position,
                PR_MESSAGE_SIZE,
                PropertyValue::Integer32(size),
            )?;
            contents.save(store)
        })
    }
}
