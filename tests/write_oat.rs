//! End-to-end write of a two-DEX image, re-read structure by structure from
//! the emitted bytes.

use std::collections::{HashMap, HashSet};

use roat::arch::{InstructionSet, PAGE_SIZE};
use roat::compiler::{
    Blob, BlobId, ClassStatus, CompiledMethod, CompiledStub, Compiler, Verifier,
};
use roat::dex::{ClassData, DexFile, InvokeType, MethodEntry};
use roat::stream::VecStream;
use roat::OatWriter;

struct TestDex {
    location: String,
    checksum: u32,
    payload: Vec<u8>,
    classes: Vec<Option<ClassData>>,
    shorties: HashMap<u32, String>,
}

impl DexFile for TestDex {
    fn location(&self) -> &str {
        &self.location
    }
    fn location_checksum(&self) -> u32 {
        self.checksum
    }
    fn file_size(&self) -> u32 {
        self.payload.len() as u32
    }
    fn bytes(&self) -> &[u8] {
        &self.payload
    }
    fn num_class_defs(&self) -> u32 {
        self.classes.len() as u32
    }
    fn class_data(&self, class_def_index: u32) -> Option<&ClassData> {
        self.classes[class_def_index as usize].as_ref()
    }
    fn method_shorty(&self, method_idx: u32) -> &str {
        self.shorties
            .get(&method_idx)
            .map_or("V", String::as_str)
    }
}

#[derive(Default)]
struct TestCompiler {
    methods: HashMap<(usize, u32), CompiledMethod>,
    invoke_stubs: HashMap<(bool, String), CompiledStub>,
}

impl Compiler for TestCompiler {
    fn instruction_set(&self) -> InstructionSet {
        InstructionSet::Arm
    }
    fn compiled_class(
        &self,
        _dex_index: usize,
        _class_def_index: u32,
    ) -> Option<&roat::compiler::CompiledClass> {
        None
    }
    fn compiled_method(&self, dex_index: usize, method_idx: u32) -> Option<&CompiledMethod> {
        self.methods.get(&(dex_index, method_idx))
    }
    fn invoke_stub(&self, is_static: bool, shorty: &str) -> Option<&CompiledStub> {
        self.invoke_stubs.get(&(is_static, shorty.to_string()))
    }
    fn is_image(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct TestVerifier {
    rejected: HashSet<(usize, u32)>,
}

impl Verifier for TestVerifier {
    fn is_class_rejected(&self, dex_index: usize, class_def_index: u32) -> bool {
        self.rejected.contains(&(dex_index, class_def_index))
    }
}

fn entry(method_idx: u32, invoke_type: InvokeType) -> MethodEntry {
    MethodEntry {
        method_idx,
        access_flags: 0,
        invoke_type,
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn at(bytes: &'a [u8], pos: u32) -> Self {
        Reader {
            bytes,
            pos: pos as usize,
        }
    }
    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.bytes[self.pos..self.pos + 4].try_into().expect("u32"));
        self.pos += 4;
        v
    }
    fn slice(&mut self, len: usize) -> &'a [u8] {
        let v = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        v
    }
}

const SHARED_CODE: [u8; 12] = [0xc0, 0xff, 0xee, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];

fn build_inputs() -> (Vec<TestDex>, TestCompiler, TestVerifier) {
    let core = TestDex {
        location: "framework/core.dex".to_string(),
        checksum: 0x1111_2222,
        payload: (0u8..20).collect(),
        classes: vec![
            None, // marker interface
            Some(ClassData {
                direct_methods: vec![entry(10, InvokeType::Static), entry(11, InvokeType::Direct)],
                virtual_methods: vec![entry(12, InvokeType::Virtual)],
            }),
        ],
        shorties: HashMap::from([(10, "II".to_string())]),
    };
    let app = TestDex {
        location: "app/app.dex".to_string(),
        checksum: 0x3333_0044,
        payload: (100u8..110).collect(),
        classes: vec![
            Some(ClassData {
                direct_methods: Vec::new(),
                virtual_methods: vec![entry(5, InvokeType::Virtual)],
            }),
            Some(ClassData {
                direct_methods: vec![entry(6, InvokeType::Direct)],
                virtual_methods: Vec::new(),
            }),
        ],
        shorties: HashMap::new(),
    };

    let mut compiler = TestCompiler::default();
    compiler.methods.insert(
        (0, 10),
        CompiledMethod {
            code: Blob::new(BlobId(100), SHARED_CODE.to_vec()),
            code_delta: 0,
            frame_size_in_bytes: 128,
            core_spill_mask: 0x4ff0,
            fp_spill_mask: 0x00ff,
            mapping_table: Blob::new(BlobId(101), vec![0x10, 0x20, 0x30]),
            vmap_table: Blob::new(BlobId(102), vec![5, 6]),
            gc_map: Blob::new(BlobId(103), vec![1, 2, 3, 4, 5]),
        },
    );
    compiler.methods.insert(
        (0, 11),
        CompiledMethod {
            code: Blob::new(BlobId(105), vec![0xab; 10]),
            code_delta: 1, // thumb entry point
            frame_size_in_bytes: 32,
            core_spill_mask: 0,
            fp_spill_mask: 0,
            mapping_table: Blob::new(BlobId(106), Vec::new()),
            vmap_table: Blob::new(BlobId(107), Vec::new()),
            gc_map: Blob::new(BlobId(108), Vec::new()),
        },
    );
    // the compiler shares method 10's code with this method
    compiler.methods.insert(
        (1, 5),
        CompiledMethod {
            code: Blob::new(BlobId(100), SHARED_CODE.to_vec()),
            code_delta: 0,
            frame_size_in_bytes: 128,
            core_spill_mask: 0x4ff0,
            fp_spill_mask: 0x00ff,
            mapping_table: Blob::new(BlobId(200), Vec::new()),
            vmap_table: Blob::new(BlobId(201), Vec::new()),
            gc_map: Blob::new(BlobId(202), Vec::new()),
        },
    );
    compiler.invoke_stubs.insert(
        (true, "II".to_string()),
        CompiledStub {
            code: Blob::new(BlobId(104), vec![0xf7; 6]),
            code_delta: 0,
        },
    );

    let mut verifier = TestVerifier::default();
    verifier.rejected.insert((1, 1));
    (vec![core, app], compiler, verifier)
}

#[test]
fn round_trips_a_two_dex_image() {
    let (dexes, compiler, verifier) = build_inputs();
    let dex_files: Vec<&dyn DexFile> = dexes.iter().map(|dex| dex as &dyn DexFile).collect();
    let writer = OatWriter::new(
        &compiler,
        &verifier,
        &dex_files,
        0xb007,
        0x7000_0000,
        "system/boot.art",
        None,
    );

    let mut out = VecStream::new("two_dex.oat");
    writer.write(&mut out).expect("write");
    let bytes = out.into_bytes();

    // written length equals the planned length
    assert_eq!(bytes.len() as u32, writer.total_size());

    // header fields
    let mut header = Reader::at(&bytes, 0);
    assert_eq!(header.slice(4), b"oat\n");
    header.slice(4); // version
    header.u32(); // checksum, covered by unit tests
    assert_eq!(header.u32(), 1); // arm
    assert_eq!(header.u32(), 0x1111_2222 ^ 0x3333_0044);
    assert_eq!(header.u32(), 0xb007);
    assert_eq!(header.u32(), 0x7000_0000);
    let executable_offset = header.u32();
    assert_eq!(executable_offset, writer.header().executable_offset());
    assert_eq!(executable_offset % PAGE_SIZE, 0);
    let location_len = header.u32();
    assert_eq!(location_len, 15);
    assert_eq!(header.slice(15), b"system/boot.art");

    // per-dex records follow the image location directly
    let mut cursor = Reader::at(&bytes, 36 + location_len);
    for (dex_index, dex) in dexes.iter().enumerate() {
        let planned = &writer.oat_dex_files()[dex_index];
        let location_len = cursor.u32();
        assert_eq!(cursor.slice(location_len as usize), dex.location.as_bytes());
        assert_eq!(cursor.u32(), dex.checksum);
        let dex_file_offset = cursor.u32();
        assert_eq!(dex_file_offset, planned.dex_file_offset());
        assert_eq!(dex_file_offset % 4, 0);
        for &planned_offset in planned.methods_offsets() {
            assert_eq!(cursor.u32(), planned_offset);
        }

        // the embedded payload is the original container, byte for byte
        let start = dex_file_offset as usize;
        assert_eq!(&bytes[start..start + dex.payload.len()], &dex.payload[..]);
    }

    // class records, flattened across both containers
    assert_eq!(writer.oat_classes().len(), 4);
    let statuses = [
        ClassStatus::NotReady,
        ClassStatus::NotReady,
        ClassStatus::NotReady,
        ClassStatus::Error,
    ];
    let class_offsets = writer
        .oat_dex_files()
        .iter()
        .flat_map(|record| record.methods_offsets().iter().copied())
        .collect::<Vec<_>>();
    for (class_index, (&class_offset, &status)) in
        class_offsets.iter().zip(&statuses).enumerate()
    {
        let planned = &writer.oat_classes()[class_index];
        assert_eq!(planned.status(), status);
        let mut record = Reader::at(&bytes, class_offset);
        assert_eq!(record.u32(), status as i32 as u32);
        for offsets in planned.method_offsets() {
            assert_eq!(record.u32(), offsets.code_offset);
            assert_eq!(record.u32(), offsets.frame_size_in_bytes);
            assert_eq!(record.u32(), offsets.core_spill_mask);
            assert_eq!(record.u32(), offsets.fp_spill_mask);
            assert_eq!(record.u32(), offsets.mapping_table_offset);
            assert_eq!(record.u32(), offsets.vmap_table_offset);
            assert_eq!(record.u32(), offsets.gc_map_offset);
            assert_eq!(record.u32(), offsets.invoke_stub_offset);
        }
    }

    // every stored code payload sits ISA-aligned behind its size prefix
    let deltas = HashMap::from([(10u32, 0u32), (11, 1), (5, 0)]);
    let methods = &writer.oat_classes()[1].method_offsets();
    for (record, method_idx) in methods.iter().zip([10u32, 11, 12]) {
        if method_idx == 12 {
            assert_eq!(record.code_offset, 0); // abstract
            continue;
        }
        let payload = record.code_offset - deltas[&method_idx];
        assert_eq!((payload - 4) % InstructionSet::Arm.code_alignment(), 0);
        let compiled = compiler.methods.get(&(0, method_idx)).expect("compiled");
        let mut stored = Reader::at(&bytes, payload - 4);
        assert_eq!(stored.u32(), compiled.code.byte_len());
        assert_eq!(stored.slice(compiled.code.data.len()), &compiled.code.data[..]);
    }

    // identity-shared code is stored once and referenced from both containers
    let shared_a = writer.oat_classes()[1].method_offsets()[0].code_offset;
    let shared_b = writer.oat_classes()[2].method_offsets()[0].code_offset;
    assert_eq!(shared_a, shared_b);

    // method 10's side tables land back to back after its code
    let record = &writer.oat_classes()[1].method_offsets()[0];
    let code_end = record.code_offset + SHARED_CODE.len() as u32;
    assert_eq!(record.mapping_table_offset, code_end);
    assert_eq!(record.vmap_table_offset, code_end + 12);
    assert_eq!(record.gc_map_offset, code_end + 12 + 4);
    let mut tables = Reader::at(&bytes, record.mapping_table_offset);
    assert_eq!(tables.u32(), 0x10);
    assert_eq!(tables.u32(), 0x20);
    assert_eq!(tables.u32(), 0x30);

    // the invoke stub for (static, "II") is stored size-prefixed as well
    assert_ne!(record.invoke_stub_offset, 0);
    let mut stub = Reader::at(&bytes, record.invoke_stub_offset - 4);
    assert_eq!(stub.u32(), 6);
    assert_eq!(stub.slice(6), &[0xf7; 6]);

    // uncompiled methods keep zero offsets and the default frame
    let abstract_record = &writer.oat_classes()[1].method_offsets()[2];
    assert_eq!(abstract_record.code_offset, 0);
    assert_eq!(abstract_record.frame_size_in_bytes, 16);
    let rejected_record = &writer.oat_classes()[3].method_offsets()[0];
    assert_eq!(rejected_record.code_offset, 0);

    // a second write and a fresh plan both reproduce the image exactly
    let mut again = VecStream::new("two_dex.oat");
    writer.write(&mut again).expect("write again");
    assert_eq!(again.bytes(), &bytes[..]);
    let replanned = OatWriter::new(
        &compiler,
        &verifier,
        &dex_files,
        0xb007,
        0x7000_0000,
        "system/boot.art",
        None,
    );
    let mut replay = VecStream::new("two_dex.oat");
    replanned.write(&mut replay).expect("write replanned");
    assert_eq!(replay.bytes(), &bytes[..]);
}
