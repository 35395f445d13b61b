//! ## [Attachments](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/46eb4828-c6a5-420d-a137-9ee36df317c1)
//!
//! An attachment object is a subnode of its message carrying its own
//! property context; the payload lives in `PidTagAttachDataBinary`.

use std::{io, sync::Arc};

use super::{message::Message, *};
use crate::{
    ltp::prop_context::*,
    ndb::{database::DbContext, node_id::*},
    PstFile,
};

pub struct Attachment<Pst: PstFile> {
    db: Arc<DbContext<Pst>>,
    properties: PropertyContext<Pst>,
}

impl<Pst: PstFile> Attachment<Pst> {
    pub(crate) fn open(
        db: &Arc<DbContext<Pst>>,
        message: &Message<Pst>,
        id: NodeId,
    ) -> io::Result<Self> {
        let id_type = id.id_type().map_err(io::Error::from)?;
        if id_type != NodeIdType::Attachment {
            return Err(MessagingError::InvalidAttachmentNodeIdType(id_type).into());
        }

        let properties = db.with_store(|store| {
            let node = message.container_node().lookup_subnode(store, id)?;
            PropertyContext::open(store, node)
        })?;
        Ok(Self {
            db: db.clone(),
            properties,
        })
    }

    /// Create the attachment subnode with its property context.
    pub(crate) fn create(
        message: &mut Message<Pst>,
        id: NodeId,
        filename: &str,
        method: i32,
        data: &[u8],
        declared_size: i32,
    ) -> io::Result<()> {
        let db = message.db().clone();
        db.with_store(|store| {
            let node = message.container_node_mut().create_subnode(store, id)?;
            let mut properties = PropertyContext::create(store, node)?;
            properties.write_prop(
                store,
                PR_ATTACH_FILENAME,
                PropertyValue::Unicode(filename.to_string()),
            )?;
            properties.write_prop(store, PR_ATTACH_METHOD, PropertyValue::Integer32(method))?;
            properties.write_prop(
                store,
                PR_ATTACH_SIZE,
                PropertyValue::Integer32(declared_size),
            )?;
            properties.write_prop(
                store,
                PR_ATTACH_DATA_BINARY,
                PropertyValue::Binary(data.to_vec()),
            )?;
            properties.save_subnode(store, message.container_node_mut())
        })
    }

    pub fn id(&self) -> NodeId {
        self.properties.node().id()
    }

    fn read_string(&self, prop_id: u16) -> io::Result<String> {
        self.db
            .with_store(|store| match self.properties.read_prop(store, prop_id)? {
                PropertyValue::Unicode(text) => Ok(text),
                PropertyValue::String8(bytes) => Ok(bytes.iter().map(|&b| b as char).collect()),
                _ => Err(MessagingError::UnexpectedPropertyValue(prop_id).into()),
            })
    }

    fn read_i32(&self, prop_id: u16) -> io::Result<i32> {
        self.db
            .with_store(|store| match self.properties.read_prop(store, prop_id)? {
                PropertyValue::Integer32(value) => Ok(value),
                _ => Err(MessagingError::UnexpectedPropertyValue(prop_id).into()),
            })
    }

    pub fn filename(&self) -> io::Result<String> {
        self.read_string(PR_ATTACH_FILENAME)
    }

    pub fn set_filename(&mut self, filename: &str) -> io::Result<()> {
        self.db.with_store(|store| {
            self.properties.write_prop(
                store,
                PR_ATTACH_FILENAME,
                PropertyValue::Unicode(filename.to_string()),
            )
        })
    }

    pub fn method(&self) -> io::Result<i32> {
        self.read_i32(PR_ATTACH_METHOD)
    }

    pub fn set_method(&mut self, method: i32) -> io::Result<()> {
        self.db.with_store(|store| {
            self.properties
                .write_prop(store, PR_ATTACH_METHOD, PropertyValue::Integer32(method))
        })
    }

    /// The declared size, which callers may set independently of the
    /// payload length.
    pub fn size(&self) -> io::Result<i32> {
        self.read_i32(PR_ATTACH_SIZE)
    }

    pub fn set_size(&mut self, size: i32) -> io::Result<()> {
        self.db.with_store(|store| {
            self.properties
                .write_prop(store, PR_ATTACH_SIZE, PropertyValue::Integer32(size))
        })
    }

    pub fn data(&self) -> io::Result<Vec<u8>> {
        self.db.with_store(|store| {
            match self.properties.read_prop(store, PR_ATTACH_DATA_BINARY)? {
                PropertyValue::Binary(bytes) => Ok(bytes),
                _ => Err(MessagingError::UnexpectedPropertyValue(PR_ATTACH_DATA_BINARY).into()),
            }
        })
    }

    pub fn set_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.db.with_store(|store| {
            self.properties.write_prop(
                store,
                PR_ATTACH_DATA_BINARY,
                PropertyValue::Binary(data.to_vec()),
            )
        })
    }

    /// Queue the attachment into its message and refresh the attachment
    /// table row; the message itself still has to be saved.
    pub fn save(&mut self, message: &mut Message<Pst>) -> io::Result<()> {
        let filename = self.filename()?;
        let method = self.method()?;
        let size = self.size()?;
        let id = self.id();

        self.db.with_store(|store| {
            self.properties
                .save_subnode(store, message.container_node_mut())
        })?;

        let mut table = message.attachment_table()?;
        self.db.with_store(|store| {
            let position = table.lookup_row(store, u32::from(id))?;
            table.set_cell(
                store,
                position,
                PR_ATTACH_FILENAME,
                PropertyValue::Unicode(filename),
            )?;
            table.set_cell(
                store,
                position,
                PR_ATTACH_METHOD,
                PropertyValue::Integer32(method),
            )?;
            table.set_cell(store, position, PR_ATTACH_SIZE, PropertyValue::Integer32(size))?;
            table.save_subnode(store, message.container_node_mut())
        })
    }
}
