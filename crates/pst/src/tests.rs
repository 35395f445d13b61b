//! End-to-end scenarios over in-memory stores: create, mutate, commit,
//! reopen, and check the on-disk invariants along the way.

use std::{
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    sync::{Arc, Mutex},
};

use crate::{
    ltp::{
        heap::HEAP_MAX_ALLOC_SIZE,
        prop_context::{HeapOrNodeId, PropertyContext, PropertyValue},
        prop_type::PropertyType,
    },
    messaging::{
        folder::Folder,
        message::Message,
        store::Store,
        PR_BODY, PR_DISPLAY_NAME,
    },
    ndb::{
        allocation_map::{amap_page_offset, FIRST_AMAP_PAGE_OFFSET},
        block::{block_size, BlockTrailer},
        database::DbContext,
        header::{Header, NdbCryptMethod},
        node_id::*,
        page::MAP_BITS_SIZE,
        root::AmapStatus,
    },
    Unicode, UnicodePstFile,
};

/// A cloneable in-memory file, so a "reopened" database sees the bytes an
/// earlier context committed.
#[derive(Clone, Default)]
struct SharedFile(Arc<Mutex<Cursor<Vec<u8>>>>);

impl SharedFile {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().get_ref().clone()
    }

    fn overwrite(&self, offset: usize, bytes: &[u8]) {
        let mut guard = self.0.lock().unwrap();
        guard.get_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl Read for SharedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.lock().unwrap().read(buf)
    }
}

impl Write for SharedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

impl Seek for SharedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.lock().unwrap().seek(pos)
    }
}

fn create_database(file: &SharedFile) -> Arc<UnicodePstFile> {
    DbContext::<Unicode>::create_from(Box::new(file.clone()), NdbCryptMethod::Permute).unwrap()
}

fn open_database(file: &SharedFile) -> Arc<UnicodePstFile> {
    DbContext::<Unicode>::open_from(Box::new(file.clone())).unwrap()
}

/// The cross-structure invariants every committed file must satisfy.
fn verify_invariants(db: &Arc<UnicodePstFile>) {
    let root = db.root_info().unwrap();
    let eof = root.file_eof_index().index();

    for info in db.block_infos().unwrap() {
        assert!(info.ref_count >= 1, "BBT entry with a zero ref count");
        let offset = info.index.index();
        if offset != 0 {
            assert!(offset >= FIRST_AMAP_PAGE_OFFSET && offset < eof);
            let disk_size =
                u64::from(block_size(info.size + BlockTrailer::size::<Unicode>()));
            assert!(
                db.is_allocated(offset, disk_size).unwrap(),
                "block bytes not marked in the AMap"
            );
        }
    }

    for info in db.node_infos().unwrap() {
        if !info.data.is_none() {
            assert!(db.block_exists(info.data).unwrap());
        }
        if !info.sub_node.is_none() {
            assert!(db.block_exists(info.sub_node).unwrap());
        }
    }
}

#[test]
fn test_create_produces_reopenable_file() {
    let file = SharedFile::default();
    {
        let db = create_database(&file);
        verify_invariants(&db);
    }
    let db = open_database(&file);
    assert!(!db.node_exists(NID_MESSAGE_STORE).unwrap());
    verify_invariants(&db);
}

#[test]
fn test_open_close_leaves_every_byte_identical() {
    let file = SharedFile::default();
    drop(create_database(&file));
    let before = SharedFile::bytes(&file);

    drop(open_database(&file));
    assert_eq!(before, SharedFile::bytes(&file));
}

#[test]
fn test_scenario_1_round_trip_empty_mailbox() {
    let file = SharedFile::default();
    {
        let db = create_database(&file);
        let mut store = Store::create(db.clone()).unwrap();
        store.set_display_name("MailBox").unwrap();
        store.save().unwrap();
        db.commit().unwrap();
    }

    let db = open_database(&file);
    assert!(db.node_exists(NID_MESSAGE_STORE).unwrap());
    let store = Store::read(db.clone()).unwrap();
    assert_eq!(store.display_name().unwrap(), "MailBox");
    verify_invariants(&db);
}

fn mailbox_fixture(file: &SharedFile) {
    let db = create_database(file);
    let mut store = Store::create(db.clone()).unwrap();
    store.set_display_name("MailBox").unwrap();
    store.save().unwrap();
    db.commit().unwrap();
}

#[test]
fn test_scenario_2_folder_create_and_delete() {
    let file = SharedFile::default();
    mailbox_fixture(&file);

    let subfolder_id;
    {
        let db = open_database(&file);
        let store = Store::read(db.clone()).unwrap();
        let mut root = store.open_root_folder().unwrap();
        let mut subfolder = root.create_subfolder("New_SubFolder1").unwrap();
        subfolder_id = subfolder.id();
        subfolder.save().unwrap();
        root.save().unwrap();
        db.commit().unwrap();
    }

    {
        let db = open_database(&file);
        let store = Store::read(db.clone()).unwrap();
        let folder = store.open_folder(subfolder_id).unwrap();
        assert_eq!(folder.name().unwrap(), "New_SubFolder1");
        assert_eq!(folder.message_count().unwrap(), 0);
        assert_eq!(folder.unread_message_count().unwrap(), 0);
        assert_eq!(folder.subfolder_count().unwrap(), 0);

        let root = store.open_root_folder().unwrap();
        assert!(root.has_subfolders().unwrap());
        let hierarchy = root.hierarchy_table().unwrap();
        db.with_store(|access| {
            let position = hierarchy.lookup_row(access, u32::from(subfolder_id))?;
            match hierarchy.read_cell(access, position, PR_DISPLAY_NAME)? {
                PropertyValue::Unicode(name) => assert_eq!(name, "New_SubFolder1"),
                other => panic!("unexpected display name cell: {other:?}"),
            }
            Ok(())
        })
        .unwrap();
        verify_invariants(&db);
    }

    // track which blocks backed the subfolder before deleting it
    let doomed_blocks: Vec<_> = {
        let db = open_database(&file);
        let info = db.lookup_node_info(subfolder_id).unwrap();
        let mut doomed = Vec::new();
        if !info.data.is_none() {
            doomed.push(info.data);
        }
        if !info.sub_node.is_none() {
            doomed.push(info.sub_node);
        }

        let store = Store::read(db.clone()).unwrap();
        let mut root = store.open_root_folder().unwrap();
        root.delete_subfolder(subfolder_id).unwrap();
        root.save().unwrap();
        db.commit().unwrap();
        doomed
    };

    let db = open_database(&file);
    assert!(!db.node_exists(subfolder_id).unwrap());
    for block in doomed_blocks {
        assert!(!db.block_exists(block).unwrap());
    }
    let store = Store::read(db.clone()).unwrap();
    let root = store.open_root_folder().unwrap();
    assert_eq!(root.subfolder_count().unwrap(), 0);
    verify_invariants(&db);
}

#[test]
fn test_scenario_3_message_with_attachment_and_recipient() {
    let file = SharedFile::default();
    mailbox_fixture(&file);

    let payload: Vec<u8> = (0..42).map(|i| b'0' + (i % 10)).collect();
    let (folder_id, message_id);
    {
        let db = open_database(&file);
        let store = Store::read(db.clone()).unwrap();
        let mut root = store.open_root_folder().unwrap();
        let mut folder = root.create_subfolder("Inbox").unwrap();
        folder_id = folder.id();

        let mut message = folder.create_message("IPM.Note").unwrap();
        message_id = message.id();
        message.set_subject("Hello").unwrap();
        message.set_body("Body").unwrap();
        message.set_html_body(b"<p>Body</p>").unwrap();
        message
            .add_recipient("Alice", 1, "SMTP", "alice@example.com")
            .unwrap();
        message
            .create_attachment("a.txt", 0, &payload, 42)
            .unwrap();
        message.save().unwrap();
        folder.save().unwrap();
        root.save().unwrap();
        db.commit().unwrap();
    }

    let db = open_database(&file);
    let store = Store::read(db.clone()).unwrap();
    let folder = store.open_folder(folder_id).unwrap();
    assert_eq!(folder.message_count().unwrap(), 1);

    let message = Message::open(db.clone(), message_id).unwrap();
    assert_eq!(message.message_class().unwrap(), "IPM.Note");
    assert_eq!(message.subject().unwrap(), "Hello");
    assert_eq!(message.body().unwrap(), "Body");
    assert!(message.html_body().unwrap().starts_with(b"<p>"));

    let recipients = message.recipients().unwrap();
    assert_eq!(recipients.len(), 1);
    assert_eq!(recipients[0].name, "Alice");
    assert_eq!(recipients[0].recipient_type, 1);
    assert_eq!(recipients[0].address_type, "SMTP");
    assert_eq!(recipients[0].email_address, "alice@example.com");

    let attachments = message.attachments().unwrap();
    assert_eq!(attachments.len(), 1);
    let attachment = message.open_attachment(attachments[0]).unwrap();
    assert_eq!(attachment.filename().unwrap(), "a.txt");
    assert_eq!(attachment.method().unwrap(), 0);
    assert_eq!(attachment.size().unwrap(), 42);
    assert_eq!(attachment.data().unwrap(), payload);
    verify_invariants(&db);
}

#[test]
fn test_scenario_4_large_body_promotion_and_demotion() {
    let file = SharedFile::default();
    mailbox_fixture(&file);

    let db = open_database(&file);
    let store = Store::read(db.clone()).unwrap();
    let mut root = store.open_root_folder().unwrap();
    let mut folder = root.create_subfolder("Drafts").unwrap();
    let mut message = folder.create_message("IPM.Note").unwrap();

    // 10 KiB of UTF-16LE on disk
    let big_body: String = "ABCDE".repeat(1024);
    message.set_body(&big_body).unwrap();
    message.save().unwrap();

    let message_id = message.id();
    let record = db
        .with_store(|access| {
            let node = access
                .lookup_node_info(message_id)?
                .map(|info| crate::ndb::node::Node::open(access, info))
                .transpose()?
                .unwrap();
            let pc = PropertyContext::open(access, node)?;
            let record = pc
                .properties(access)?
                .into_iter()
                .find(|(id, _)| *id == PR_BODY)
                .unwrap()
                .1;

            match HeapOrNodeId::from(record.value) {
                HeapOrNodeId::Node(subnode_id) => {
                    let subnode = pc.node().lookup_subnode(access, subnode_id)?;
                    assert_eq!(subnode.size(), big_body.len() as u64 * 2);
                }
                other => panic!("10 KiB body should live in a subnode, got {other:?}"),
            }
            assert_eq!(record.prop_type, PropertyType::Unicode);
            Ok(record)
        })
        .unwrap();
    assert!(big_body.len() * 2 > HEAP_MAX_ALLOC_SIZE);
    let promoted_subnode = NodeId::from(record.value);

    // shrink to eight bytes; the value demotes back into the heap
    message.set_body("tiny").unwrap();
    message.save().unwrap();
    assert_eq!(message.body().unwrap(), "tiny");

    db.with_store(|access| {
        let node = access
            .lookup_node_info(message_id)?
            .map(|info| crate::ndb::node::Node::open(access, info))
            .transpose()?
            .unwrap();
        let pc = PropertyContext::open(access, node)?;
        let record = pc
            .properties(access)?
            .into_iter()
            .find(|(id, _)| *id == PR_BODY)
            .unwrap()
            .1;
        match HeapOrNodeId::from(record.value) {
            HeapOrNodeId::Heap(_) => {}
            other => panic!("small body should live in the heap, got {other:?}"),
        }
        assert!(!pc.node().subnode_exists(access, promoted_subnode)?);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_scenario_6_amap_rebuild_is_bit_identical() {
    let file = SharedFile::default();
    mailbox_fixture(&file);

    let amap_page_count = {
        let db = open_database(&file);
        let eof = db.root_info().unwrap().file_eof_index().index();
        (eof - FIRST_AMAP_PAGE_OFFSET).div_ceil(crate::ndb::allocation_map::AMAP_PAGE_INTERVAL)
    };

    let amap_payload = |bytes: &[u8]| -> Vec<Vec<u8>> {
        (0..amap_page_count)
            .map(|index| {
                let offset = amap_page_offset(index) as usize;
                bytes[offset..offset + MAP_BITS_SIZE].to_vec()
            })
            .collect()
    };
    let before = amap_payload(&SharedFile::bytes(&file));

    // tear the file: invalidate the flag (with valid header CRCs) and
    // destroy every AMap page
    {
        let mut header = Header::<Unicode>::reload(&mut file.clone()).unwrap();
        header.root_mut().set_amap_status(AmapStatus::Invalid);
        header.flush(&mut file.clone()).unwrap();
        for index in 0..amap_page_count {
            file.overwrite(amap_page_offset(index) as usize, &[0_u8; MAP_BITS_SIZE]);
        }
    }

    let db = open_database(&file);
    assert_eq!(
        db.root_info().unwrap().amap_is_valid(),
        AmapStatus::Valid2
    );
    assert_eq!(amap_payload(&SharedFile::bytes(&file)), before);
    verify_invariants(&db);
}

#[test]
fn test_scenario_7_child_context_conflict() {
    let file = SharedFile::default();
    mailbox_fixture(&file);

    let parent = open_database(&file);
    let child = parent.create_context().unwrap();

    // parent moves first
    {
        let mut store = Store::read(parent.clone()).unwrap();
        store.set_display_name("ParentWins").unwrap();
        store.save().unwrap();
    }
    parent.commit().unwrap();

    // the child mutated the same node from the older snapshot
    {
        let mut store = Store::read(child.clone()).unwrap();
        store.set_display_name("ChildValue").unwrap();
        store.save().unwrap();
    }
    let err = child.commit().unwrap_err();
    assert!(err.to_string().contains("Conflicting changes"));

    child.discard_changes().unwrap();
    drop(child);
    drop(parent);

    let db = open_database(&file);
    let store = Store::read(db).unwrap();
    assert_eq!(store.display_name().unwrap(), "ParentWins");
}

#[test]
fn test_child_context_commit_propagates() {
    let file = SharedFile::default();
    mailbox_fixture(&file);

    let parent = open_database(&file);
    let child = parent.create_context().unwrap();
    {
        let mut store = Store::read(child.clone()).unwrap();
        store.set_display_name("FromChild").unwrap();
        store.save().unwrap();
    }
    child.commit().unwrap();
    drop(child);
    parent.commit().unwrap();
    drop(parent);

    let db = open_database(&file);
    let store = Store::read(db).unwrap();
    assert_eq!(store.display_name().unwrap(), "FromChild");
}

#[test]
fn test_block_ids_grow_across_runs() {
    let file = SharedFile::default();
    mailbox_fixture(&file);

    let max_bid = |db: &Arc<UnicodePstFile>| {
        db.block_infos()
            .unwrap()
            .into_iter()
            .map(|info| u64::from(info.block))
            .max()
            .unwrap()
    };

    let first_run = {
        let db = open_database(&file);
        max_bid(&db)
    };

    {
        let db = open_database(&file);
        let mut store = Store::read(db.clone()).unwrap();
        store.set_display_name("Renamed").unwrap();
        store.save().unwrap();
        db.commit().unwrap();
    }

    let db = open_database(&file);
    assert!(max_bid(&db) > first_run);
}

#[test]
fn test_deep_mailbox_survives_many_commits() {
    let file = SharedFile::default();
    mailbox_fixture(&file);

    for round in 0..4 {
        let db = open_database(&file);
        let store = Store::read(db.clone()).unwrap();
        let mut root = store.open_root_folder().unwrap();
        let mut folder = root.create_subfolder(&format!("Folder{round}")).unwrap();
        for index in 0..3 {
            let mut message = folder
                .create_message("IPM.Note")
                .unwrap();
            message
                .set_subject(&format!("Message {round}/{index}"))
                .unwrap();
            message.save().unwrap();
        }
        folder.save().unwrap();
        root.save().unwrap();
        db.commit().unwrap();
        verify_invariants(&db);
    }

    let db = open_database(&file);
    let store = Store::read(db.clone()).unwrap();
    let root = store.open_root_folder().unwrap();
    assert_eq!(root.subfolder_count().unwrap(), 4);
    for id in root.sub_folders().unwrap() {
        let folder = Folder::open(db.clone(), id).unwrap();
        assert_eq!(folder.message_count().unwrap(), 3);
        assert_eq!(folder.messages().unwrap().len(), 3);
    }
    verify_invariants(&db);
}
