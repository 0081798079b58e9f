// Integration tests for template execution and the variable tree

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use pretty_assertions::assert_eq;
use template_runtime::span::{SourceId, Span};
use template_runtime::*;

fn template(mut interner: StringInterner, statements: Vec<Stmt>) -> Template {
    let registry = Registry::builtin(&mut interner);
    Template::new(interner, registry, statements)
}

fn field(interner: &mut StringInterner, name: &str, kind: BasicKind) -> Stmt {
    Stmt::Declare(VariableDeclaration::new(
        interner.intern(name),
        TypeDefinition::basic(kind),
    ))
}

fn declare(interner: &mut StringInterner, name: &str, ty: &TypeRef) -> Stmt {
    Stmt::Declare(VariableDeclaration::new(interner.intern(name), ty.clone()))
}

/// Resolve a dotted path starting at the root scope
fn path(rt: &Runtime<'_>, path: &str) -> VarId {
    let mut parts = path.split('.');
    let mut id = rt.lookup_str(rt.root(), parts.next().unwrap()).unwrap();
    for part in parts {
        id = rt.member_str(id, part).unwrap();
    }
    id
}

/// Evaluator closure reading a variable from the current scope
fn read_var(name: &'static str) -> impl FnMut(&mut Runtime<'_>) -> Result<Value, EvalError> {
    move |rt| {
        let scope = rt.current_scope();
        let id = rt.lookup_str(scope, name)?;
        rt.value(id)
    }
}

// ========== Basic Struct Test ==========

#[test]
fn test_header_struct() {
    let mut interner = StringInterner::new();
    let magic = Stmt::Declare(
        VariableDeclaration::new(interner.intern("magic"), TypeDefinition::basic(BasicKind::Char))
            .array(Dim::Const(4)),
    );
    let header = TypeDefinition::compound(CompoundDefinition::structure(
        "Header",
        vec![
            magic,
            field(&mut interner, "size", BasicKind::U32),
            field(&mut interner, "count", BasicKind::U16),
        ],
    ));
    let stmts = vec![declare(&mut interner, "header", &header)];
    let tpl = template(interner, stmts);

    let mut data = b"RIFF".to_vec();
    data.extend_from_slice(&0x24u32.to_le_bytes());
    data.extend_from_slice(&2u16.to_le_bytes());
    let ds = SliceDataSource::new(&data);
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    assert!(exec.is_ok(), "{:?}", exec.errors);

    let rt = exec.runtime();
    let header = path(rt, "header");
    let magic = path(rt, "header.magic");
    let size = path(rt, "header.size");
    let count = path(rt, "header.count");
    assert_eq!(rt.value(magic).unwrap(), Value::String("RIFF".into()));
    assert_eq!(rt.value(size).unwrap(), Value::Unsigned(0x24));
    assert_eq!(rt.value(count).unwrap(), Value::Unsigned(2));
    assert_eq!(rt.value(header).unwrap(), Value::Ref(header));
    assert_eq!(rt.start_of(Slot::Var(header)).unwrap(), 0);
    assert_eq!(rt.size_of(Slot::Var(header)).unwrap(), 10);
    assert_eq!(rt.start_of(Slot::Var(count)).unwrap(), 8);
    assert_eq!(rt.parent_of(count).unwrap(), header);
    assert_eq!(rt.members(header).len(), 3);
    assert_eq!(rt.context().position(), 10);
}

#[test]
fn test_config_driven_big_endian() {
    let config = EngineConfig::from_toml_str("default_endian = \"big\"\n").unwrap();
    let mut interner = StringInterner::new();
    let stmts = vec![field(&mut interner, "word", BasicKind::U16)];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[0x12, 0x34]);
    let mut exec = TemplateEngine::with_config(config).run(&tpl, &ds, &mut NoExpressions);
    let rt = exec.runtime();
    let word = path(rt, "word");
    assert_eq!(rt.value(word).unwrap(), Value::Unsigned(0x1234));
}

#[test]
fn test_enum_label() {
    let mut interner = StringInterner::new();
    let mut builder = RegistryBuilder::new(&mut interner);
    let members = vec![
        (interner.intern("Red"), 0),
        (interner.intern("Green"), 1),
        (interner.intern("Blue"), 2),
    ];
    let color = builder
        .define_enum(EnumDefinition::new("Color", BasicKind::U8, members), &interner)
        .unwrap();
    let stmts = vec![
        declare(&mut interner, "first", &color),
        declare(&mut interner, "second", &color),
    ];
    let tpl = Template::new(interner, builder.build(), stmts);
    let ds = SliceDataSource::new(&[2, 7]);
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    let rt = exec.runtime();
    let first = path(rt, "first");
    let second = path(rt, "second");
    assert_eq!(rt.value(first).unwrap(), Value::Unsigned(2));
    assert_eq!(rt.enum_label(first).unwrap(), Some("Blue".to_string()));
    assert_eq!(rt.enum_label(second).unwrap(), None);
    // Enum members are visible as constants from any scope
    let blue = rt.lookup_str(rt.root(), "Blue").unwrap();
    assert_eq!(rt.value(blue).unwrap(), Value::Unsigned(2));
}

// ========== Dynamic Array Test ==========

#[test]
fn test_dynamic_array_length_from_field() {
    let mut interner = StringInterner::new();
    let items = Stmt::Declare(
        VariableDeclaration::new(interner.intern("items"), TypeDefinition::basic(BasicKind::U16))
            .array(Dim::Dynamic(ExprRef(0))),
    );
    let stmts = vec![field(&mut interner, "count", BasicKind::U8), items];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[3, 1, 0, 2, 0, 3, 0, 0xFF]);
    let mut ev = ClosureEvaluator::new().on(ExprRef(0), read_var("count"));
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut ev);
    assert!(exec.is_ok(), "{:?}", exec.errors);

    let rt = exec.runtime();
    let items = path(rt, "items");
    assert_eq!(rt.len(items).unwrap(), 3);
    let values: Vec<Value> = (0..3)
        .map(|i| {
            let slot = rt.element(items, i).unwrap();
            rt.load(slot).unwrap()
        })
        .collect();
    assert_eq!(
        values,
        vec![Value::Unsigned(1), Value::Unsigned(2), Value::Unsigned(3)]
    );
    assert!(rt.element(items, 3).is_err());
    assert_eq!(rt.context().position(), 7);
}

// ========== Lazy Array Test ==========

#[test]
fn test_lazy_array_element_matches_sequential_decode() {
    let data: Vec<u8> = (0..1000u32).flat_map(|i| (i * 7919).to_le_bytes()).collect();
    let mut interner = StringInterner::new();
    let stmts = vec![Stmt::Declare(
        VariableDeclaration::new(interner.intern("values"), TypeDefinition::basic(BasicKind::U32))
            .array(Dim::Const(1000)),
    )];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&data);
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    let rt = exec.runtime();
    let values = path(rt, "values");
    assert!(matches!(rt.variable(values).kind, VariableKind::LazyArray(_)));

    let before = rt.context().reader().save_state();
    let slot = rt.element(values, 500).unwrap();
    assert_eq!(rt.load(slot).unwrap(), Value::Unsigned(500 * 7919));
    assert_eq!(rt.start_of(slot).unwrap(), 2000);
    assert_eq!(rt.size_of(slot).unwrap(), 4);
    assert_eq!(rt.context().reader().save_state(), before);
    assert_eq!(rt.size_of(Slot::Var(values)).unwrap(), 4000);
}

#[test]
fn test_lazy_compound_elements() {
    let mut interner = StringInterner::new();
    let point = TypeDefinition::compound(CompoundDefinition::structure(
        "Point",
        vec![
            field(&mut interner, "x", BasicKind::U16),
            field(&mut interner, "y", BasicKind::U16),
        ],
    ));
    let stmts = vec![
        Stmt::Declare(
            VariableDeclaration::new(interner.intern("points"), point).array(Dim::Const(100)),
        ),
        field(&mut interner, "tail", BasicKind::U8),
    ];
    let tpl = template(interner, stmts);
    let mut data: Vec<u8> = (0..200u16).flat_map(|i| i.to_le_bytes()).collect();
    data.push(0xEE);
    let ds = SliceDataSource::new(&data);
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    assert!(exec.is_ok(), "{:?}", exec.errors);

    let rt = exec.runtime();
    let points = path(rt, "points");
    assert!(matches!(rt.variable(points).kind, VariableKind::LazyArray(_)));
    let count = rt.variable_count();
    let before = rt.context().position();

    let p = rt.element_var(points, 50).unwrap();
    let y = rt.member_str(p, "y").unwrap();
    assert_eq!(rt.value(y).unwrap(), Value::Unsigned(101));
    assert_eq!(rt.start_of(Slot::Var(p)).unwrap(), 200);
    assert_eq!(rt.parent_of(p).unwrap(), points);
    assert_eq!(rt.context().position(), before);

    // The most recent element is reused
    assert_eq!(rt.element_var(points, 50).unwrap(), p);
    assert!(rt.variable_count() > count);

    let tail = path(rt, "tail");
    assert_eq!(rt.value(tail).unwrap(), Value::Unsigned(0xEE));
}

#[test]
fn test_lazy_scans_reuse_arena_space() {
    let mut interner = StringInterner::new();
    let pair = TypeDefinition::compound(CompoundDefinition::structure(
        "Pair",
        vec![
            field(&mut interner, "a", BasicKind::U16),
            field(&mut interner, "b", BasicKind::U16),
        ],
    ));
    let stmts = vec![Stmt::Declare(
        VariableDeclaration::new(interner.intern("pairs"), pair).array(Dim::Const(1000)),
    )];
    let tpl = template(interner, stmts);
    let data: Vec<u8> = (0..1000u16)
        .flat_map(|i| [i.to_le_bytes(), (!i).to_le_bytes()].concat())
        .collect();
    let ds = SliceDataSource::new(&data);
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    assert!(exec.is_ok(), "{:?}", exec.errors);

    let rt = exec.runtime();
    let pairs = path(rt, "pairs");
    let count = rt.variable_count();
    for _ in 0..3 {
        for i in 0..1000u16 {
            let p = rt.element_var(pairs, i as u64).unwrap();
            let a = rt.member_str(p, "a").unwrap();
            let b = rt.member_str(p, "b").unwrap();
            assert_eq!(rt.value(a).unwrap(), Value::Unsigned(i as u64));
            assert_eq!(rt.value(b).unwrap(), Value::Unsigned(!i as u64));
        }
    }
    // One element: the struct and its two fields
    assert_eq!(rt.variable_count(), count + 3);
}

#[test]
fn test_nested_lazy_scans_reuse_arena_space() {
    let mut interner = StringInterner::new();
    let cell = TypeDefinition::compound(CompoundDefinition::structure(
        "Cell",
        vec![field(&mut interner, "v", BasicKind::U8)],
    ));
    let row = TypeDefinition::compound(CompoundDefinition::structure(
        "Row",
        vec![
            field(&mut interner, "tag", BasicKind::U8),
            Stmt::Declare(VariableDeclaration::new(interner.intern("cells"), cell).array(Dim::Const(4))),
        ],
    ));
    let stmts = vec![Stmt::Declare(
        VariableDeclaration::new(interner.intern("rows"), row).array(Dim::Const(50)),
    )];
    let tpl = template(interner, stmts);
    let data: Vec<u8> = (0..50u8)
        .flat_map(|i| [i, i * 4, i * 4 + 1, i * 4 + 2, i * 4 + 3])
        .collect();
    let ds = SliceDataSource::new(&data);
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    assert!(exec.is_ok(), "{:?}", exec.errors);

    let rt = exec.runtime();
    let rows = path(rt, "rows");
    let count = rt.variable_count();
    for _ in 0..2 {
        for i in 0..50u8 {
            let row = rt.element_var(rows, i as u64).unwrap();
            let cells = rt.member_str(row, "cells").unwrap();
            assert!(matches!(rt.variable(cells).kind, VariableKind::LazyArray(_)));
            for j in 0..4u8 {
                let cell = rt.element_var(cells, j as u64).unwrap();
                let v = rt.member_str(cell, "v").unwrap();
                assert_eq!(rt.value(v).unwrap(), Value::Unsigned((i * 4 + j) as u64));
            }
            let tag = rt.member_str(row, "tag").unwrap();
            assert_eq!(rt.value(tag).unwrap(), Value::Unsigned(i as u64));
        }
    }
    // A row with its tag and cells, plus one cell with its field
    assert!(rt.variable_count() <= count + 5);
}

#[test]
fn test_initialized_local_keeps_elements_eager() {
    let mut interner = StringInterner::new();
    let entry = TypeDefinition::compound(CompoundDefinition::structure(
        "Entry",
        vec![
            field(&mut interner, "x", BasicKind::U16),
            Stmt::Declare(
                VariableDeclaration::new(interner.intern("k"), TypeDefinition::basic(BasicKind::U8))
                    .local()
                    .init(ExprRef(7)),
            ),
        ],
    ));
    let stmts = vec![Stmt::Declare(
        VariableDeclaration::new(interner.intern("items"), entry).array(Dim::Const(200)),
    )];
    let tpl = template(interner, stmts);
    let data: Vec<u8> = (0..200u16).flat_map(|i| i.to_le_bytes()).collect();
    let ds = SliceDataSource::new(&data);
    let mut ev = ClosureEvaluator::new().constant(ExprRef(7), Value::Unsigned(9));
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut ev);
    assert!(exec.is_ok(), "{:?}", exec.errors);

    let rt = exec.runtime();
    let items = path(rt, "items");
    assert!(matches!(rt.variable(items).kind, VariableKind::Array(_)));
    let third = rt.element_var(items, 3).unwrap();
    let x = rt.member_str(third, "x").unwrap();
    let k = rt.member_str(third, "k").unwrap();
    assert_eq!(rt.value(x).unwrap(), Value::Unsigned(3));
    assert_eq!(rt.value(k).unwrap(), Value::Unsigned(9));
    assert_eq!(rt.size_of(Slot::Var(items)).unwrap(), 400);
}

#[test]
fn test_bitfield_elements_are_decoded_in_turn() {
    let mut interner = StringInterner::new();
    let nibbles = TypeDefinition::compound(CompoundDefinition::structure(
        "Nibbles",
        vec![
            Stmt::Declare(
                VariableDeclaration::new(interner.intern("lo"), TypeDefinition::basic(BasicKind::U8))
                    .bits(Dim::Const(4)),
            ),
            Stmt::Declare(
                VariableDeclaration::new(interner.intern("hi"), TypeDefinition::basic(BasicKind::U8))
                    .bits(Dim::Const(4)),
            ),
        ],
    ));
    let stmts = vec![Stmt::Declare(
        VariableDeclaration::new(interner.intern("cells"), nibbles).array(Dim::Const(3)),
    )];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[0x21, 0x43, 0x65]);
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    assert!(exec.is_ok(), "{:?}", exec.errors);

    let rt = exec.runtime();
    let cells = path(rt, "cells");
    assert!(matches!(rt.variable(cells).kind, VariableKind::Array(_)));
    let third = rt.element_var(cells, 2).unwrap();
    let hi = rt.member_str(third, "hi").unwrap();
    assert_eq!(rt.value(hi).unwrap(), Value::Unsigned(6));
    assert_eq!(rt.size_of(Slot::Var(cells)).unwrap(), 3);
}

// ========== Union Test ==========

#[test]
fn test_union_members_share_start_in_any_order() {
    let orders: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    let data: Vec<u8> = (0..16).collect();
    for order in orders {
        let mut interner = StringInterner::new();
        let members = [
            ("a", BasicKind::U32),
            ("b", BasicKind::U16),
            ("c", BasicKind::U64),
        ];
        let body = order
            .iter()
            .map(|&i| field(&mut interner, members[i].0, members[i].1))
            .collect();
        let union = TypeDefinition::compound(CompoundDefinition::union("U", body));
        let stmts = vec![
            field(&mut interner, "pad", BasicKind::U16),
            declare(&mut interner, "u", &union),
            field(&mut interner, "tail", BasicKind::U8),
        ];
        let tpl = template(interner, stmts);
        let ds = SliceDataSource::new(&data);
        let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
        assert!(exec.is_ok(), "{:?}", exec.errors);

        let rt = exec.runtime();
        for name in ["u.a", "u.b", "u.c"] {
            let id = path(rt, name);
            assert_eq!(rt.start_of(Slot::Var(id)).unwrap(), 2, "{} in {:?}", name, order);
        }
        let u = path(rt, "u");
        assert_eq!(rt.size_of(Slot::Var(u)).unwrap(), 8);
        let tail = path(rt, "tail");
        assert_eq!(rt.start_of(Slot::Var(tail)).unwrap(), 10);
        assert_eq!(rt.value(tail).unwrap(), Value::Unsigned(10));
        let b = path(rt, "u.b");
        assert_eq!(rt.value(b).unwrap(), Value::Unsigned(0x0302));
    }
}

// ========== Duplicate Name Test ==========

#[test]
fn test_duplicate_names_fold_into_array() {
    let mut interner = StringInterner::new();
    let stmts = vec![
        field(&mut interner, "x", BasicKind::U8),
        field(&mut interner, "x", BasicKind::U8),
    ];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[0x11, 0x22]);
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    let rt = exec.runtime();

    let x = path(rt, "x");
    assert_eq!(rt.len(x).unwrap(), 2);
    assert_eq!(rt.value(x).unwrap(), Value::Unsigned(0x22));
    let first = rt.element(x, 0).unwrap();
    let second = rt.element(x, 1).unwrap();
    assert_eq!(rt.load(first).unwrap(), Value::Unsigned(0x11));
    assert_eq!(rt.load(second).unwrap(), Value::Unsigned(0x22));
    assert_eq!(rt.start_of(Slot::Var(x)).unwrap(), 0);
    assert_eq!(rt.size_of(Slot::Var(x)).unwrap(), 2);
    // Both original declarations stay in the member list
    assert_eq!(rt.members(rt.root()).len(), 2);
}

#[test]
fn test_loop_declarations_accumulate() {
    let mut interner = StringInterner::new();
    let stmts = vec![Stmt::While {
        cond: ExprRef(0),
        body: vec![field(&mut interner, "entry", BasicKind::U16)],
    }];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[1, 0, 2, 0, 3, 0, 4, 0]);
    let mut remaining = 3;
    let mut ev = ClosureEvaluator::new().on(ExprRef(0), move |_| {
        remaining -= 1;
        Ok(Value::Bool(remaining >= 0))
    });
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut ev);
    assert!(exec.is_ok(), "{:?}", exec.errors);

    let rt = exec.runtime();
    let entry = path(rt, "entry");
    assert_eq!(rt.len(entry).unwrap(), 3);
    let last = rt.element(entry, 2).unwrap();
    assert_eq!(rt.load(last).unwrap(), Value::Unsigned(3));
    assert_eq!(rt.context().position(), 6);
}

// ========== Reflection Test ==========

#[test]
fn test_sizeof_and_startof() {
    let mut interner = StringInterner::new();
    let stmts = vec![
        field(&mut interner, "skip", BasicKind::U16),
        field(&mut interner, "value", BasicKind::U32),
        Stmt::Declare(
            VariableDeclaration::new(interner.intern("tmp"), TypeDefinition::basic(BasicKind::U32))
                .local(),
        ),
    ];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[0; 8]);
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    let rt = exec.runtime();

    let value = path(rt, "value");
    assert_eq!(rt.start_of(Slot::Var(value)).unwrap(), 2);
    assert_eq!(rt.size_of(Slot::Var(value)).unwrap(), 4);

    let tmp = path(rt, "tmp");
    assert_eq!(rt.value(tmp).unwrap(), Value::Unsigned(0));
    assert_eq!(
        rt.start_of(Slot::Var(tmp)).unwrap_err().category(),
        ErrorCategory::Lookup
    );
    assert!(matches!(
        rt.size_of(Slot::Var(tmp)).unwrap_err().kind,
        ErrorKind::NoSize(_)
    ));
}

#[test]
fn test_bitfield_struct_layout() {
    let mut interner = StringInterner::new();
    let bits = |interner: &mut StringInterner, name: &str, kind: BasicKind, width: u64| {
        Stmt::Declare(
            VariableDeclaration::new(interner.intern(name), TypeDefinition::basic(kind))
                .bits(Dim::Const(width)),
        )
    };
    let flags = TypeDefinition::compound(CompoundDefinition::structure(
        "Flags",
        vec![
            bits(&mut interner, "a", BasicKind::U8, 3),
            bits(&mut interner, "b", BasicKind::U8, 5),
            bits(&mut interner, "c", BasicKind::U16, 4),
            bits(&mut interner, "d", BasicKind::U16, 12),
        ],
    ));
    let stmts = vec![
        declare(&mut interner, "flags", &flags),
        field(&mut interner, "tail", BasicKind::U8),
    ];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[0xAD, 0x34, 0x12, 0x99]);
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    assert!(exec.is_ok(), "{:?}", exec.errors);

    let rt = exec.runtime();
    let expected = [("a", 5), ("b", 21), ("c", 4), ("d", 0x123)];
    for (name, value) in expected {
        let id = path(rt, &format!("flags.{}", name));
        assert_eq!(rt.value(id).unwrap(), Value::Unsigned(value), "{}", name);
    }
    let c = path(rt, "flags.c");
    assert_eq!(rt.start_of(Slot::Var(c)).unwrap(), 1);
    assert_eq!(rt.size_of(Slot::Var(c)).unwrap(), 2);
    let flags = path(rt, "flags");
    assert_eq!(rt.size_of(Slot::Var(flags)).unwrap(), 3);
    let tail = path(rt, "tail");
    assert_eq!(rt.value(tail).unwrap(), Value::Unsigned(0x99));
}

#[test]
fn test_dynamic_bit_width() {
    let mut interner = StringInterner::new();
    let stmts = vec![Stmt::Declare(
        VariableDeclaration::new(interner.intern("flags"), TypeDefinition::basic(BasicKind::U16))
            .bits(Dim::Dynamic(ExprRef(0))),
    )];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[0xFF, 0xFF]);
    let mut ev = ClosureEvaluator::new().constant(ExprRef(0), Value::Unsigned(12));
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut ev);
    let rt = exec.runtime();
    let flags = path(rt, "flags");
    assert_eq!(rt.value(flags).unwrap(), Value::Unsigned(0xFFF));

    let mut ev = ClosureEvaluator::new().constant(ExprRef(0), Value::Unsigned(17));
    let exec = TemplateEngine::new().run(&tpl, &ds, &mut ev);
    assert_eq!(
        exec.errors[0].kind,
        ErrorKind::BitWidthOverflow {
            ty: "u16".into(),
            width: 17,
            capacity: 16
        }
    );
}

// ========== Parameterized Struct Test ==========

#[test]
fn test_struct_parameters() {
    let mut interner = StringInterner::new();
    let len = interner.intern("len");
    let chunk = TypeDefinition::compound(
        CompoundDefinition::structure(
            "Chunk",
            vec![Stmt::Declare(
                VariableDeclaration::new(interner.intern("data"), TypeDefinition::basic(BasicKind::U8))
                    .array(Dim::Dynamic(ExprRef(0))),
            )],
        )
        .with_params(vec![Param {
            name: len,
            is_reference: false,
        }]),
    );
    let stmts = vec![
        Stmt::Declare(
            VariableDeclaration::new(interner.intern("first"), chunk.clone())
                .args(vec![ExprRef(1)]),
        ),
        Stmt::Declare(
            VariableDeclaration::new(interner.intern("second"), chunk.clone())
                .args(vec![ExprRef(2)]),
        ),
    ];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[1, 2, 3, 4, 5, 6]);
    let mut ev = ClosureEvaluator::new()
        .on(ExprRef(0), read_var("len"))
        .constant(ExprRef(1), Value::Unsigned(2))
        .constant(ExprRef(2), Value::Unsigned(4));
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut ev);
    assert!(exec.is_ok(), "{:?}", exec.errors);

    let rt = exec.runtime();
    let second = path(rt, "second");
    assert_eq!(rt.start_of(Slot::Var(second)).unwrap(), 2);
    assert_eq!(rt.size_of(Slot::Var(second)).unwrap(), 4);
    let data = path(rt, "second.data");
    assert_eq!(rt.len(data).unwrap(), 4);
    // Parameters resolve inside the body but are not listed as members
    let len = rt.lookup_str(second, "len").unwrap();
    assert_eq!(rt.value(len).unwrap(), Value::Unsigned(4));
    assert_eq!(rt.members(second).len(), 1);
}

#[test]
fn test_struct_argument_count_is_checked() {
    let mut interner = StringInterner::new();
    let n = interner.intern("n");
    let sized = TypeDefinition::compound(
        CompoundDefinition::structure("Sized", vec![]).with_params(vec![Param {
            name: n,
            is_reference: false,
        }]),
    );
    let stmts = vec![declare(&mut interner, "s", &sized)];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[0; 4]);
    let exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    assert_eq!(
        exec.errors[0].kind,
        ErrorKind::ArityMismatch {
            ty: "Sized".into(),
            expected: 1,
            found: 0
        }
    );
    assert_eq!(exec.errors[0].category(), ErrorCategory::Schema);
}

#[test]
fn test_reference_parameter() {
    let mut interner = StringInterner::new();
    let counter = interner.intern("counter");
    let bump = TypeDefinition::compound(
        CompoundDefinition::structure("Bump", vec![Stmt::Eval(ExprRef(0))]).with_params(vec![
            Param {
                name: counter,
                is_reference: true,
            },
        ]),
    );
    let stmts = vec![
        Stmt::Declare(
            VariableDeclaration::new(counter, TypeDefinition::basic(BasicKind::U32)).local(),
        ),
        Stmt::Declare(
            VariableDeclaration::new(interner.intern("once"), bump.clone()).args(vec![ExprRef(1)]),
        ),
        Stmt::Declare(
            VariableDeclaration::new(interner.intern("twice"), bump.clone()).args(vec![ExprRef(1)]),
        ),
    ];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[]);
    let mut ev = ClosureEvaluator::new()
        .on(ExprRef(0), |rt| {
            let scope = rt.current_scope();
            let param = rt.lookup_str(scope, "counter")?;
            let next = rt.value(param)?.to_unsigned()? + 1;
            rt.assign(Slot::Var(param), Value::Unsigned(next))?;
            Ok(Value::Null)
        })
        .on_argument(ExprRef(1), |rt| {
            let root = rt.root();
            Ok(Argument::Variable(Slot::Var(rt.lookup_str(root, "counter")?)))
        });
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut ev);
    assert!(exec.is_ok(), "{:?}", exec.errors);

    let rt = exec.runtime();
    let counter = path(rt, "counter");
    assert_eq!(rt.value(counter).unwrap(), Value::Unsigned(2));
}

#[test]
fn test_reference_parameter_needs_variable() {
    let mut interner = StringInterner::new();
    let target = interner.intern("target");
    let holder = TypeDefinition::compound(
        CompoundDefinition::structure("Holder", vec![]).with_params(vec![Param {
            name: target,
            is_reference: true,
        }]),
    );
    let stmts = vec![Stmt::Declare(
        VariableDeclaration::new(interner.intern("h"), holder).args(vec![ExprRef(0)]),
    )];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[]);
    let mut ev = ClosureEvaluator::new().constant(ExprRef(0), Value::Unsigned(5));
    let exec = TemplateEngine::new().run(&tpl, &ds, &mut ev);
    assert_eq!(
        exec.errors[0].kind,
        ErrorKind::NotAddressable {
            ty: "Holder".into(),
            param: "target".into()
        }
    );
}

#[test]
fn test_local_reference_aliases_variable() {
    let mut interner = StringInterner::new();
    let stmts = vec![
        field(&mut interner, "magic", BasicKind::U16),
        Stmt::Declare(
            VariableDeclaration::new(interner.intern("alias"), TypeDefinition::basic(BasicKind::U16))
                .local()
                .reference()
                .init(ExprRef(0)),
        ),
    ];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[0x34, 0x12]);
    let mut ev = ClosureEvaluator::new().on(ExprRef(0), |rt| {
        let root = rt.root();
        Ok(Value::Ref(rt.lookup_str(root, "magic")?))
    });
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut ev);
    assert!(exec.is_ok(), "{:?}", exec.errors);

    let rt = exec.runtime();
    let alias = path(rt, "alias");
    assert!(matches!(rt.variable(alias).kind, VariableKind::Reference { .. }));
    assert_eq!(rt.value(alias).unwrap(), Value::Unsigned(0x1234));
    assert_eq!(rt.start_of(Slot::Var(alias)).unwrap(), 0);
    assert_eq!(rt.size_of(Slot::Var(alias)).unwrap(), 2);
}

#[test]
fn test_reference_declarations_are_checked() {
    let mut interner = StringInterner::new();
    let stmts = vec![Stmt::Declare(
        VariableDeclaration::new(interner.intern("field"), TypeDefinition::basic(BasicKind::U8))
            .reference(),
    )];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[1]);
    let exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    assert_eq!(
        exec.errors[0].kind,
        ErrorKind::InvalidDeclaration {
            name: "field".into(),
            reason: "a positional variable cannot be a reference".into(),
        }
    );
    assert_eq!(exec.errors[0].category(), ErrorCategory::Schema);

    let mut interner = StringInterner::new();
    let stmts = vec![Stmt::Declare(
        VariableDeclaration::new(interner.intern("alias"), TypeDefinition::basic(BasicKind::U8))
            .local()
            .reference()
            .init(ExprRef(0)),
    )];
    let tpl = template(interner, stmts);
    let mut ev = ClosureEvaluator::new().constant(ExprRef(0), Value::Unsigned(5));
    let exec = TemplateEngine::new().run(&tpl, &ds, &mut ev);
    assert_eq!(
        exec.errors[0].kind,
        ErrorKind::InvalidDeclaration {
            name: "alias".into(),
            reason: "a reference must be initialized with a variable".into(),
        }
    );
}

// ========== Error Handling Test ==========

#[test]
fn test_partial_tree_survives_error() {
    let mut interner = StringInterner::new();
    let header = TypeDefinition::compound(CompoundDefinition::structure(
        "Header",
        vec![
            field(&mut interner, "a", BasicKind::U32),
            field(&mut interner, "b", BasicKind::U32),
        ],
    ));
    let stmts = vec![
        declare(&mut interner, "header", &header),
        field(&mut interner, "after", BasicKind::U8),
    ];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[1, 0, 0, 0, 2, 0]);
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);

    assert_eq!(exec.errors.len(), 1);
    assert!(exec.errors[0].is_read_oob());
    assert_eq!(exec.errors[0].category(), ErrorCategory::Decode);

    let rt = exec.runtime();
    let a = path(rt, "header.a");
    assert_eq!(rt.value(a).unwrap(), Value::Unsigned(1));
    let header = path(rt, "header");
    assert!(rt.member_str(header, "b").is_err());
    // Execution stopped at the first error
    assert!(rt.lookup_str(rt.root(), "after").is_err());
}

#[test]
fn test_error_location_from_source() {
    let mut interner = StringInterner::new();
    let source = "u32 a;\nu64 b;\n";
    let stmts = vec![
        Stmt::Declare(
            VariableDeclaration::new(interner.intern("a"), TypeDefinition::basic(BasicKind::U32))
                .at(Span::new(0, 6, SourceId(0))),
        ),
        Stmt::Declare(
            VariableDeclaration::new(interner.intern("b"), TypeDefinition::basic(BasicKind::U64))
                .at(Span::new(7, 13, SourceId(0))),
        ),
    ];
    let tpl = template(interner, stmts).with_source(source);
    let ds = SliceDataSource::new(&[0; 6]);
    let exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    assert_eq!(exec.errors.len(), 1);
    assert_eq!(exec.errors[0].line, Some(2));
    assert_eq!(exec.errors[0].col, Some(1));
    assert!(exec.errors[0].to_string().starts_with("error at 2:1"));
}

#[test]
fn test_incomplete_declaration_is_rejected() {
    let mut interner = StringInterner::new();
    let data = interner.intern("data");
    let tpl = template(interner, vec![]);
    let ds = SliceDataSource::new(&[0; 4]);
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    let rt = exec.runtime();
    let root = rt.root();
    let decl = VariableDeclaration::new(data, TypeDefinition::basic(BasicKind::U8))
        .array(Dim::Dynamic(ExprRef(0)));
    let err = decl
        .materialize(rt, root, Evaluated::default(), &mut NoExpressions)
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::IncompleteType("data".into()));
}

#[test]
fn test_nesting_limit() {
    let config = EngineConfig {
        max_recursion_depth: 2,
        ..EngineConfig::default()
    };
    let mut interner = StringInterner::new();
    let inner = TypeDefinition::compound(CompoundDefinition::structure(
        "Inner",
        vec![field(&mut interner, "x", BasicKind::U8)],
    ));
    let mid = TypeDefinition::compound(CompoundDefinition::structure(
        "Mid",
        vec![declare(&mut interner, "inner", &inner)],
    ));
    let outer = TypeDefinition::compound(CompoundDefinition::structure(
        "Outer",
        vec![declare(&mut interner, "mid", &mid)],
    ));
    let stmts = vec![declare(&mut interner, "outer", &outer)];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[0; 4]);
    let exec = TemplateEngine::with_config(config).run(&tpl, &ds, &mut NoExpressions);
    assert_eq!(
        exec.errors[0].kind,
        ErrorKind::Limit {
            what: "recursion depth",
            limit: 2
        }
    );
}

// ========== Observer Test ==========

#[derive(Default)]
struct Recorder {
    events: Rc<RefCell<Vec<String>>>,
}

impl Observer for Recorder {
    fn on_variable_creating(&mut self, _decl: &VariableDeclaration) -> Result<(), String> {
        self.events.borrow_mut().push("creating".into());
        Ok(())
    }

    fn on_variable_created(
        &mut self,
        _decl: &VariableDeclaration,
        id: VarId,
        var: &Variable,
    ) -> Result<(), String> {
        self.events
            .borrow_mut()
            .push(format!("created {} {}", id.index(), var.kind.describe()));
        Ok(())
    }
}

struct Failing;

impl Observer for Failing {
    fn on_variable_creating(&mut self, _decl: &VariableDeclaration) -> Result<(), String> {
        Err("refused".into())
    }

    fn on_variable_created(
        &mut self,
        _decl: &VariableDeclaration,
        _id: VarId,
        _var: &Variable,
    ) -> Result<(), String> {
        Err("refused".into())
    }
}

#[test]
fn test_observers_see_every_declaration() {
    let mut interner = StringInterner::new();
    let stmts = vec![
        field(&mut interner, "a", BasicKind::U8),
        field(&mut interner, "b", BasicKind::U8),
    ];
    let tpl = template(interner, stmts);
    let ds = SliceDataSource::new(&[1, 2]);
    let recorder = Recorder::default();
    let events = recorder.events.clone();
    let observers: Vec<Box<dyn Observer>> = vec![Box::new(Failing), Box::new(recorder)];
    let mut exec = TemplateEngine::new().run_observed(&tpl, &ds, &mut NoExpressions, observers);

    assert!(exec.is_ok(), "{:?}", exec.errors);
    let events = events.borrow();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0], "creating");
    assert!(events[1].starts_with("created") && events[1].ends_with("scalar"));
    let rt = exec.runtime();
    let b = path(rt, "b");
    assert_eq!(rt.value(b).unwrap(), Value::Unsigned(2));
}

// ========== Data Source Test ==========

#[test]
fn test_memory_mapped_source() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[0x78, 0x56, 0x34, 0x12, 0xAA]).unwrap();
    file.flush().unwrap();
    let ds = MmapDataSource::open(file.path()).unwrap();
    assert_eq!(ds.size(), 5);

    let mut interner = StringInterner::new();
    let stmts = vec![
        field(&mut interner, "word", BasicKind::U32),
        field(&mut interner, "byte", BasicKind::U8),
    ];
    let tpl = template(interner, stmts);
    let mut exec = TemplateEngine::new().run(&tpl, &ds, &mut NoExpressions);
    assert!(exec.is_ok(), "{:?}", exec.errors);
    let rt = exec.runtime();
    let word = path(rt, "word");
    assert_eq!(rt.value(word).unwrap(), Value::Unsigned(0x1234_5678));
}

#[test]
fn test_variables_remember_their_stream() {
    let main = [0x01, 0x02];
    let extra = [0xAA, 0xBB, 0xCC, 0xDD];
    let main_ds = SliceDataSource::new(&main);
    let extra_ds = SliceDataSource::new(&extra);

    let mut interner = StringInterner::new();
    let side = interner.intern("side");
    let stmts = vec![field(&mut interner, "head", BasicKind::U16)];
    let tpl = template(interner, stmts);
    let mut exec = TemplateEngine::new().run(&tpl, &main_ds, &mut NoExpressions);
    let rt = exec.runtime();
    let root = rt.root();
    let original = rt.context().active();

    let stream = rt.context_mut().open_stream(&extra_ds);
    assert_eq!(rt.context().stream_count(), 2);
    let decl = VariableDeclaration::new(side, TypeDefinition::basic(BasicKind::U16));
    decl.materialize(rt, root, Evaluated::default(), &mut NoExpressions)
        .unwrap();
    rt.context_mut().set_active(original).unwrap();
    assert_eq!(rt.context().position(), 2);

    let side = path(rt, "side");
    assert_eq!(rt.value(side).unwrap(), Value::Unsigned(0xBBAA));
    assert_eq!(rt.start_of(Slot::Var(side)).unwrap(), 0);
    rt.context_mut().set_active(stream).unwrap();
    assert_eq!(rt.context().position(), 2);
}
