//! ## [Message Store](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/aa0539bd-e7bf-4cec-8bde-0b87c2a86baf)

use std::{io, sync::Arc};

use super::{folder::Folder, *};
use crate::{
    ltp::{prop_context::*, table_context::TableContext},
    ndb::{database::DbContext, node_id::*},
    Ansi, PstFile, Unicode,
};

/// The store object: the property context on `NID_MESSAGE_STORE`.
pub struct Store<Pst: PstFile> {
    db: Arc<DbContext<Pst>>,
    properties: PropertyContext<Pst>,
}

impl<Pst: PstFile> Store<Pst> {
    /// Open the message store of an existing database.
    pub fn read(db: Arc<DbContext<Pst>>) -> io::Result<Self> {
        let node = db.lookup_node(NID_MESSAGE_STORE)?;
        let properties = db.with_store(|store| PropertyContext::open(store, node))?;
        Ok(Self { db, properties })
    }

    /// Build an empty message store on a freshly created database: the
    /// store node and the root folder with its three tables. Nothing is
    /// persisted until the context commits.
    pub fn create(db: Arc<DbContext<Pst>>) -> io::Result<Self> {
        let node = db.create_node(NID_MESSAGE_STORE, NodeId::default())?;
        let properties = db.with_store(|store| {
            let mut properties = PropertyContext::create(store, node)?;
            properties.write_prop(
                store,
                PR_DISPLAY_NAME,
                PropertyValue::Unicode(String::new()),
            )?;
            properties.save(store)?;
            Ok(properties)
        })?;

        Folder::create_root(&db)?;

        Ok(Self { db, properties })
    }

    pub fn database(&self) -> &Arc<DbContext<Pst>> {
        &self.db
    }

    pub fn display_name(&self) -> io::Result<String> {
        self.db.with_store(|store| {
            match self.properties.read_prop(store, PR_DISPLAY_NAME)? {
                PropertyValue::Unicode(name) => Ok(name),
                PropertyValue::String8(bytes) => {
                    Ok(bytes.iter().map(|&b| b as char).collect())
                }
                _ => Err(MessagingError::StoreDisplayNameNotFound.into()),
            }
        })
    }

    pub fn set_display_name(&mut self, name: &str) -> io::Result<()> {
        self.db.with_store(|store| {
            self.properties.write_prop(
                store,
                PR_DISPLAY_NAME,
                PropertyValue::Unicode(name.to_string()),
            )
        })
    }

    /// Queue the store node's pending property changes.
    pub fn save(&mut self) -> io::Result<()> {
        self.db.with_store(|store| self.properties.save(store))
    }

    pub fn open_root_folder(&self) -> io::Result<Folder<Pst>> {
        Folder::open(self.db.clone(), NID_ROOT_FOLDER)
    }

    pub fn open_folder(&self, id: NodeId) -> io::Result<Folder<Pst>> {
        Folder::open(self.db.clone(), id)
    }

    /// The root folder's hierarchy table, for browsing.
    pub fn root_hierarchy_table(&self) -> io::Result<TableContext<Pst>> {
        self.open_root_folder()?.hierarchy_table()
    }
}

/// A store of either format variant, as returned by
/// [`open_store`](crate::open_store).
pub enum AnyStore {
    Unicode(Store<Unicode>),
    Ansi(Store<Ansi>),
}

impl AnyStore {
    pub fn display_name(&self) -> io::Result<String> {
        match self {
            Self::Unicode(store) => store.display_name(),
            Self::Ansi(store) => store.display_name(),
        }
    }
}
