//! ## [Folders](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/dee5b9d0-5513-4c5e-94aa-8bd28a9350b2)
//!
//! A folder is four nodes sharing one index: the folder PC and its
//! hierarchy, contents and associated-contents tables. Search folders
//! reuse the same back-end but expose no hierarchy of their own.

use std::{io, sync::Arc};

use super::{message::Message, *};
use crate::{
    ltp::{prop_context::*, table_context::*, LtpError},
    ndb::{database::DbContext, node_id::*},
    PstFile,
};

fn table_nid(folder: NodeId, table_type: NodeIdType) -> io::Result<NodeId> {
    NodeId::new(table_type, folder.index()).map_err(io::Error::from)
}

/// A folder object and the database it came from.
pub struct Folder<Pst: PstFile> {
    db: Arc<DbContext<Pst>>,
    properties: PropertyContext<Pst>,
    search_folder: bool,
}

impl<Pst: PstFile> Folder<Pst> {
    pub fn open(db: Arc<DbContext<Pst>>, id: NodeId) -> io::Result<Self> {
        let id_type = id.id_type().map_err(io::Error::from)?;
        let search_folder = match id_type {
            NodeIdType::NormalFolder => false,
            NodeIdType::SearchFolder => true,
            other => return Err(MessagingError::InvalidFolderNodeIdType(other).into()),
        };

        let node = db.lookup_node(id)?;
        let properties = db.with_store(|store| PropertyContext::open(store, node))?;
        Ok(Self {
            db,
            properties,
            search_folder,
        })
    }

    /// Create the root folder on a fresh store; its parent is itself.
    pub(crate) fn create_root(db: &Arc<DbContext<Pst>>) -> io::Result<()> {
        Self::create_folder_nodes(db, NID_ROOT_FOLDER, NID_ROOT_FOLDER, "")?;
        Ok(())
    }

    fn create_folder_nodes(
        db: &Arc<DbContext<Pst>>,
        id: NodeId,
        parent: NodeId,
        name: &str,
    ) -> io::Result<()> {
        let node = db.create_node(id, parent)?;
        db.with_store(|store| {
            let mut properties = PropertyContext::create(store, node)?;
            properties.write_prop(
                store,
                PR_DISPLAY_NAME,
                PropertyValue::Unicode(name.to_string()),
            )?;
            properties.write_prop(store, PR_CONTENT_COUNT, PropertyValue::Integer32(0))?;
            properties.write_prop(
                store,
                PR_CONTENT_UNREAD_COUNT,
                PropertyValue::Integer32(0),
            )?;
            properties.write_prop(store, PR_SUBFOLDERS, PropertyValue::Boolean(false))?;
            properties.save(store)
        })?;

        for (table_type, columns) in [
            (NodeIdType::HierarchyTable, HIERARCHY_TABLE_COLUMNS),
            (NodeIdType::ContentsTable, CONTENTS_TABLE_COLUMNS),
            (NodeIdType::AssociatedContentsTable, CONTENTS_TABLE_COLUMNS),
        ] {
            let table_node = db.create_node(table_nid(id, table_type)?, id)?;
            db.with_store(|store| {
                let mut table = TableContext::create(store, table_node, columns)?;
                table.save(store)
            })?;
        }
        Ok(())
    }

    pub fn id(&self) -> NodeId {
        self.properties.node().id()
    }

    pub fn parent_id(&self) -> NodeId {
        self.properties.node().parent_id()
    }

    pub fn is_search_folder(&self) -> bool {
        self.search_folder
    }

    pub fn name(&self) -> io::Result<String> {
        self.db.with_store(|store| {
            match self.properties.read_prop(store, PR_DISPLAY_NAME)? {
                PropertyValue::Unicode(name) => Ok(name),
                PropertyValue::String8(bytes) => Ok(bytes.iter().map(|&b| b as char).collect()),
                _ => Err(MessagingError::UnexpectedPropertyValue(PR_DISPLAY_NAME).into()),
            }
        })
    }

    pub fn set_name(&mut self, name: &str) -> io::Result<()> {
        self.db.with_store(|store| {
            self.properties.write_prop(
                store,
                PR_DISPLAY_NAME,
                PropertyValue::Unicode(name.to_string()),
            )
        })
    }

    fn read_counter(&self, prop_id: u16) -> io::Result<i32> {
        self.db
            .with_store(|store| match self.properties.read_prop(store, prop_id)? {
                PropertyValue::Integer32(value) => Ok(value),
                _ => Err(MessagingError::UnexpectedPropertyValue(prop_id).into()),
            })
    }

    fn write_counter(&mut self, prop_id: u16, value: i32) -> io::Result<()> {
        self.db.with_store(|store| {
            self.properties
                .write_prop(store, prop_id, PropertyValue::Integer32(value))
        })
    }

    pub fn message_count(&self) -> io::Result<i32> {
        self.read_counter(PR_CONTENT_COUNT)
    }

    pub fn set_message_count(&mut self, count: i32) -> io::Result<()> {
        self.write_counter(PR_CONTENT_COUNT, count)
    }

    pub fn unread_message_count(&self) -> io::Result<i32> {
        self.read_counter(PR_CONTENT_UNREAD_COUNT)
    }

    pub fn set_unread_message_count(&mut self, count: i32) -> io::Result<()> {
        self.write_counter(PR_CONTENT_UNREAD_COUNT, count)
    }

    pub fn has_subfolders(&self) -> io::Result<bool> {
        self.db
            .with_store(
                |store| match self.properties.read_prop(store, PR_SUBFOLDERS)? {
                    PropertyValue::Boolean(value) => Ok(value),
                    _ => Err(MessagingError::UnexpectedPropertyValue(PR_SUBFOLDERS).into()),
                },
            )
    }

    pub fn set_has_subfolders(&mut self, value: bool) -> io::Result<()> {
        self.db.with_store(|store| {
            self.properties
                .write_prop(store, PR_SUBFOLDERS, PropertyValue::Boolean(value))
        })
    }

    /// This folder's hierarchy table; search folders have none.
    pub fn hierarchy_table(&self) -> io::Result<TableContext<Pst>> {
        if self.search_folder {
            return Err(MessagingError::SearchFolderHierarchy.into());
        }
        let node = self
            .db
            .lookup_node(table_nid(self.id(), NodeIdType::HierarchyTable)?)?;
        self.db.with_store(|store| TableContext::open(store, node))
    }

    /// This folder's contents table. The search-folder variant ("gust")
    /// is documented but not supported here.
    pub fn contents_table(&self) -> io::Result<TableContext<Pst>> {
        if self.search_folder {
            return Err(LtpError::NotImplemented("search folder contents table").into());
        }
        let node = self
            .db
            .lookup_node(table_nid(self.id(), NodeIdType::ContentsTable)?)?;
        self.db.with_store(|store| TableContext::open(store, node))
    }

    pub fn associated_contents_table(&self) -> io::Result<TableContext<Pst>> {
        let node = self
            .db
            .lookup_node(table_nid(self.id(), NodeIdType::AssociatedContentsTable)?)?;
        self.db.with_store(|store| TableContext::open(store, node))
    }

    /// Subfolder ids, in hierarchy-table order. Empty for search folders.
    pub fn sub_folders(&self) -> io::Result<Vec<NodeId>> {
        if self.search_folder {
            return Ok(Vec::new());
        }
        let table = self.hierarchy_table()?;
        self.db.with_store(|store| {
            Ok(table
                .rows(store)?
                .into_iter()
                .map(|row| NodeId::from(row.row_id))
                .collect())
        })
    }

    pub fn subfolder_count(&self) -> io::Result<usize> {
        Ok(self.sub_folders()?.len())
    }

    /// Message ids, in contents-table order.
    pub fn messages(&self) -> io::Result<Vec<NodeId>> {
        let table = self.contents_table()?;
        self.db.with_store(|store| {
            Ok(table
                .rows(store)?
                .into_iter()
                .map(|row| NodeId::from(row.row_id))
                .collect())
        })
    }

    /// Create a subfolder: its four nodes, plus a hierarchy row here.
    pub fn create_subfolder(&mut self, name: &str) -> io::Result<Folder<Pst>> {
        if self.search_folder {
            return Err(MessagingError::SearchFolderHierarchy.into());
        }

        let id = self.db.alloc_nid(NodeIdType::NormalFolder)?;
        Self::create_folder_nodes(&self.db, id, self.id(), name)?;

        let mut hierarchy = self.hierarchy_table()?;
        self.db.with_store(|store| {
            let position = hierarchy.add_row(store, u32::from(id))?;
            hierarchy.set_cell(
                store,
                position,
                PR_DISPLAY_NAME,
                PropertyValue::Unicode(name.to_string()),
            )?;
            hierarchy.set_cell(store, position, PR_CONTENT_COUNT, PropertyValue::Integer32(0))?;
            hierarchy.set_cell(
                store,
                position,
                PR_CONTENT_UNREAD_COUNT,
                PropertyValue::Integer32(0),
            )?;
            hierarchy.set_cell(
                store,
                position,
                PR_SUBFOLDERS,
                PropertyValue::Boolean(false),
            )?;
            hierarchy.save(store)
        })?;

        self.set_has_subfolders(true)?;
        Folder::open(self.db.clone(), id)
    }

    /// Delete a subfolder and everything under it.
    pub fn delete_subfolder(&mut self, id: NodeId) -> io::Result<()> {
        let subfolder = Folder::open(self.db.clone(), id)?;

        for message in subfolder.messages()? {
            self.db.delete_node(message)?;
        }
        for nested in subfolder.sub_folders()? {
            let mut subfolder = Folder::open(self.db.clone(), id)?;
            subfolder.delete_subfolder(nested)?;
        }

        for table_type in [
            NodeIdType::HierarchyTable,
            NodeIdType::ContentsTable,
            NodeIdType::AssociatedContentsTable,
        ] {
            self.db.delete_node(table_nid(id, table_type)?)?;
        }
        self.db.delete_node(id)?;

        let mut hierarchy = self.hierarchy_table()?;
        self.db.with_store(|store| {
            let position = hierarchy.lookup_row(store, u32::from(id))?;
            hierarchy.delete_row(store, position)?;
            hierarchy.save(store)
        })?;

        if self.subfolder_count()? == 0 {
            self.set_has_subfolders(false)?;
        }
        Ok(())
    }

    /// Create a message in this folder with the given message class.
    pub fn create_message(&mut self, message_class: &str) -> io::Result<Message<Pst>> {
        let id = self.db.alloc_nid(NodeIdType::NormalMessage)?;
        Message::create(&self.db, id, self.id(), message_class)?;

        let mut contents = self.contents_table()?;
        self.db.with_store(|store| {
            let position = contents.add_row(store, u32::from(id))?;
            contents.set_cell(
                store,
                position,
                PR_MESSAGE_CLASS,
                PropertyValue::String8(message_class.bytes().collect()),
            )?;
            contents.save(store)
        })?;

        let count = self.message_count()?;
        self.set_message_count(count + 1)?;
        Message::open(self.db.clone(), id)
    }

    /// Delete a message and drop its contents-table row.
    pub fn delete_message(&mut self, id: NodeId) -> io::Result<()> {
        self.db.delete_node(id)?;

        let mut contents = self.contents_table()?;
        self.db.with_store(|store| {
            let position = contents.lookup_row(store, u32::from(id))?;
            contents.delete_row(store, position)?;
            contents.save(store)
        })?;

        let count = self.message_count()?;
        self.set_message_count(count.saturating_sub(1))?;
        Ok(())
    }

    /// Queue pending changes and refresh this folder's row in the parent
    /// hierarchy table.
    pub fn save(&mut self) -> io::Result<()> {
        self.db.with_store(|store| self.properties.save(store))?;

        let parent = self.parent_id();
        if parent == self.id() {
            return Ok(());
        }

        let name = self.name()?;
        let message_count = self.message_count()?;
        let unread = self.unread_message_count()?;

        let parent = Folder::open(self.db.clone(), parent)?;
        let mut hierarchy = parent.hierarchy_table()?;
        let id = self.id();
        self.db.with_store(|store| {
            let position = hierarchy.lookup_row(store, u32::from(id))?;
            hierarchy.set_cell(store, position, PR_DISPLAY_NAME, PropertyValue::Unicode(name))?;
            hierarchy.set_cell(
                store,
                position,
                PR_CONTENT_COUNT,
                PropertyValue::Integer32(message_count),
            )?;
            hierarchy.set_cell(
                store,
                position,
                PR_CONTENT_UNREAD_COUNT,
                PropertyValue::Integer32(unread),
            )?;
            hierarchy.save(store)
        })
    }
}
