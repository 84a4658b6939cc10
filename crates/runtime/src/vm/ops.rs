//! Arithmetic, comparison, construction, and access operations

use super::Vm;
use crate::router::AllocRoute;
use lattice_core::chunk::Chunk;
use lattice_core::error::LatError;
use lattice_core::map::LatMap;
use lattice_core::opcode::Opcode;
use lattice_core::phase::Phase;
use lattice_core::value::{
    lat_eq, BufferData, EnumData, LatValue, MapData, StructData, ValueKind,
};

impl Vm {
    pub(super) fn op_binary(&mut self, op: Opcode) -> Result<(), LatError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let out = match op {
            Opcode::Eq => LatValue::boolean(lat_eq(&lhs, &rhs)),
            Opcode::Neq => LatValue::boolean(!lat_eq(&lhs, &rhs)),
            Opcode::Add => self.op_add(lhs, rhs)?,
            Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                arithmetic(op, &lhs, &rhs)?
            }
            Opcode::Lt | Opcode::Gt | Opcode::LtEq | Opcode::GtEq => {
                comparison(op, &lhs, &rhs)?
            }
            Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor | Opcode::Shl | Opcode::Shr => {
                bitwise(op, &lhs, &rhs)?
            }
            other => return Err(LatError::internal(format!("{:?} is not binary", other))),
        };
        self.stack.push(out);
        Ok(())
    }

    fn op_add(&mut self, lhs: LatValue, rhs: LatValue) -> Result<LatValue, LatError> {
        match (&lhs.kind, &rhs.kind) {
            (ValueKind::Str(a), ValueKind::Str(b)) => {
                let mut s = a.to_heap_string();
                s.push_str(b.as_str());
                Ok(LatValue::string(s))
            }
            (ValueKind::Array(a), ValueKind::Array(b)) => {
                let mut elems = a.borrow().clone();
                elems.extend(b.borrow().iter().cloned());
                let out = LatValue::array(elems);
                self.heaps.fluid.track_value(&out);
                Ok(out)
            }
            _ => arithmetic(Opcode::Add, &lhs, &rhs),
        }
    }

    pub(super) fn op_unary(&mut self, op: Opcode) -> Result<(), LatError> {
        let v = self.pop()?;
        let out = match op {
            Opcode::Neg => match v.kind {
                ValueKind::Int(n) => LatValue::int(-n),
                ValueKind::Float(x) => LatValue::float(-x),
                _ => {
                    return Err(LatError::type_error(format!(
                        "cannot negate {}",
                        v.type_name()
                    )))
                }
            },
            Opcode::Not => LatValue::boolean(!v.is_truthy()),
            Opcode::BitNot => match v.kind {
                ValueKind::Int(n) => LatValue::int(!n),
                _ => {
                    return Err(LatError::type_error(format!(
                        "bitwise not expects an int, got {}",
                        v.type_name()
                    )))
                }
            },
            other => return Err(LatError::internal(format!("{:?} is not unary", other))),
        };
        self.stack.push(out);
        Ok(())
    }

    // --- constructors ---

    pub(super) fn op_build(&mut self, op: Opcode, chunk: &Chunk) -> Result<(), LatError> {
        match op {
            Opcode::BuildArray => {
                let count = self.read_u16(chunk) as usize;
                let elems = self.stack.split_off(self.stack.len() - count);
                let out = LatValue::array(elems);
                self.heaps.fluid.track_value(&out);
                self.stack.push(out);
            }
            Opcode::BuildTuple => {
                let count = self.read_u8(chunk) as usize;
                let elems = self.stack.split_off(self.stack.len() - count);
                // Tuples are crystal by construction: the elements are
                // deep-frozen into one fresh region.
                let region = self.heaps.regions.create();
                let frozen = self.heaps.with_route(AllocRoute::Region(region), |h| {
                    elems
                        .iter()
                        .map(|v| crate::phase_ops::deep_clone(h, v))
                        .collect::<Result<Vec<_>, _>>()
                })?;
                let out = LatValue::tuple(frozen).with_region(region);
                self.stack.push(out);
            }
            Opcode::BuildRange => {
                let end = self.pop()?;
                let start = self.pop()?;
                match (&start.kind, &end.kind) {
                    (ValueKind::Int(a), ValueKind::Int(b)) => {
                        self.stack.push(LatValue::range(*a, *b));
                    }
                    _ => {
                        return Err(LatError::type_error(
                            "range bounds must be ints",
                        ))
                    }
                }
            }
            Opcode::BuildStruct => {
                let name_idx = self.read_u16(chunk) as usize;
                let count = self.read_u8(chunk) as usize;
                let mut field_names = Vec::with_capacity(count);
                for _ in 0..count {
                    let idx = self.read_u16(chunk) as usize;
                    field_names.push(std::sync::Arc::from(
                        self.const_name(chunk, idx)?.as_str(),
                    ));
                }
                let name = self.const_name(chunk, name_idx)?;
                let fields = self.stack.split_off(self.stack.len() - count);
                let out = LatValue::struct_value(StructData {
                    name: name.as_str().into(),
                    field_names,
                    fields,
                    field_phases: None,
                });
                self.heaps.fluid.track_value(&out);
                self.stack.push(out);
            }
            Opcode::BuildEnum => {
                let enum_idx = self.read_u16(chunk) as usize;
                let variant_idx = self.read_u16(chunk) as usize;
                let count = self.read_u8(chunk) as usize;
                let enum_name = self.const_name(chunk, enum_idx)?;
                let variant = self.const_name(chunk, variant_idx)?;
                let payload = self.stack.split_off(self.stack.len() - count);
                let out = LatValue::enum_value(EnumData {
                    enum_name: enum_name.as_str().into(),
                    variant: variant.as_str().into(),
                    payload,
                });
                self.heaps.fluid.track_value(&out);
                self.stack.push(out);
            }
            Opcode::BuildMap => {
                let pairs = self.read_u16(chunk) as usize;
                let mut flat = self.stack.split_off(self.stack.len() - pairs * 2);
                let mut entries = LatMap::new();
                for _ in 0..pairs {
                    let value = flat.pop().unwrap_or_else(LatValue::nil);
                    let key = flat.pop().unwrap_or_else(LatValue::nil);
                    let key = match &key.kind {
                        ValueKind::Str(s) => s.as_str().to_string(),
                        _ => {
                            return Err(LatError::type_error(format!(
                                "map keys must be strings, got {}",
                                key.type_name()
                            )))
                        }
                    };
                    entries.insert(&key, value);
                }
                let out = LatValue::map(MapData {
                    entries,
                    key_phases: None,
                });
                self.heaps.fluid.track_value(&out);
                self.stack.push(out);
            }
            Opcode::BuildSet => {
                let count = self.read_u16(chunk) as usize;
                let elems = self.stack.split_off(self.stack.len() - count);
                let mut keys = LatMap::new();
                for v in elems {
                    match &v.kind {
                        ValueKind::Str(s) => {
                            keys.insert(s.as_str(), ());
                        }
                        _ => {
                            return Err(LatError::type_error(format!(
                                "set members must be strings, got {}",
                                v.type_name()
                            )))
                        }
                    }
                }
                let out = LatValue::set(keys);
                self.heaps.fluid.track_value(&out);
                self.stack.push(out);
            }
            other => return Err(LatError::internal(format!("{:?} is not a build", other))),
        }
        Ok(())
    }

    // --- indexing and fields ---

    pub(super) fn index_value(
        &mut self,
        target: &LatValue,
        index: &LatValue,
    ) -> Result<LatValue, LatError> {
        match (&target.kind, &index.kind) {
            (ValueKind::Array(arr), ValueKind::Int(i)) => {
                let arr = arr.borrow();
                element_at(&arr, *i, "array")
            }
            (ValueKind::Array(arr), ValueKind::Range(a, b)) => {
                let src = arr.borrow();
                let (s, e) = slice_bounds(*a, *b, src.len())?;
                let out = LatValue::array(src[s..e].to_vec());
                self.heaps.fluid.track_value(&out);
                Ok(out)
            }
            (ValueKind::Tuple(elems), ValueKind::Int(i)) => element_at(elems, *i, "tuple"),
            (ValueKind::Str(s), ValueKind::Int(i)) => {
                let text = s.as_str();
                let i = *i;
                if i < 0 || i as usize >= text.chars().count() {
                    return Err(LatError::bad_index(format!(
                        "string index {} out of bounds",
                        i
                    )));
                }
                let ch = text.chars().nth(i as usize).unwrap_or('\0');
                Ok(LatValue::string(ch.to_string()))
            }
            (ValueKind::Str(s), ValueKind::Range(a, b)) => {
                let chars: Vec<char> = s.as_str().chars().collect();
                let (start, end) = slice_bounds(*a, *b, chars.len())?;
                Ok(LatValue::string(chars[start..end].iter().collect::<String>()))
            }
            (ValueKind::Buffer(buf), ValueKind::Int(i)) => {
                let i = *i;
                if i < 0 {
                    return Err(LatError::bad_index(format!("buffer index {}", i)));
                }
                buf.get(i as usize)
                    .map(|b| LatValue::int(b as i64))
                    .ok_or_else(|| {
                        LatError::bad_index(format!("buffer index {} out of bounds", i))
                    })
            }
            (ValueKind::Map(map), ValueKind::Str(key)) => Ok(map
                .borrow()
                .entries
                .get(key.as_str())
                .cloned()
                .unwrap_or_else(LatValue::nil)),
            (ValueKind::Range(a, b), ValueKind::Int(i)) => {
                let i = *i;
                if i < 0 || a + i >= *b {
                    return Err(LatError::bad_index(format!(
                        "range index {} out of bounds",
                        i
                    )));
                }
                Ok(LatValue::int(a + i))
            }
            _ => Err(LatError::type_error(format!(
                "cannot index {} with {}",
                target.type_name(),
                index.type_name()
            ))),
        }
    }

    pub(super) fn set_index(
        &mut self,
        target: &LatValue,
        index: &LatValue,
        value: LatValue,
    ) -> Result<(), LatError> {
        if target.phase == Phase::Crystal {
            return Err(LatError::crystal_mutation(target.type_name()));
        }
        match (&target.kind, &index.kind) {
            (ValueKind::Array(arr), ValueKind::Int(i)) => {
                let mut arr = arr.borrow_mut();
                let len = arr.len();
                let i = *i;
                if i < 0 || i as usize >= len {
                    return Err(LatError::bad_index(format!(
                        "array index {} out of bounds (len {})",
                        i, len
                    )));
                }
                arr[i as usize] = value;
                Ok(())
            }
            (ValueKind::Map(map), ValueKind::Str(key)) => {
                let key = key.as_str();
                if map.borrow().key_phase(key, target.phase) == Phase::Crystal {
                    return Err(LatError::crystal_mutation(&format!("map key '{}'", key)));
                }
                map.borrow_mut().entries.insert(key, value);
                Ok(())
            }
            (ValueKind::Buffer(buf), ValueKind::Int(i)) => {
                let byte = match value.kind {
                    ValueKind::Int(b) if (0..=255).contains(&b) => b as u8,
                    _ => {
                        return Err(LatError::type_error(
                            "buffer elements must be ints in 0..=255",
                        ))
                    }
                };
                let cells = match crate::builtins::buffer_heap_bytes(buf) {
                    Some(rc) => rc,
                    None => return Err(LatError::crystal_mutation("buffer")),
                };
                let mut bytes = cells.borrow_mut();
                let i = *i;
                if i < 0 || i as usize >= bytes.len() {
                    return Err(LatError::bad_index(format!(
                        "buffer index {} out of bounds",
                        i
                    )));
                }
                bytes[i as usize] = byte;
                Ok(())
            }
            _ => Err(LatError::type_error(format!(
                "cannot assign into {} with {} index",
                target.type_name(),
                index.type_name()
            ))),
        }
    }

    pub(super) fn set_slice(
        &mut self,
        target: &LatValue,
        start: &LatValue,
        end: &LatValue,
        value: LatValue,
    ) -> Result<(), LatError> {
        if target.phase == Phase::Crystal {
            return Err(LatError::crystal_mutation(target.type_name()));
        }
        let (s, e) = match (&start.kind, &end.kind) {
            (ValueKind::Int(a), ValueKind::Int(b)) => (*a, *b),
            _ => return Err(LatError::type_error("slice bounds must be ints")),
        };
        let replacement = match &value.kind {
            ValueKind::Array(src) => src.borrow().clone(),
            _ => {
                return Err(LatError::type_error(
                    "slice assignment expects an array value",
                ))
            }
        };
        match &target.kind {
            ValueKind::Array(arr) => {
                let mut arr = arr.borrow_mut();
                let (s, e) = slice_bounds(s, e, arr.len())?;
                arr.splice(s..e, replacement);
                Ok(())
            }
            _ => Err(LatError::type_error(format!(
                "cannot slice-assign into {}",
                target.type_name()
            ))),
        }
    }

    pub(super) fn get_field(
        &mut self,
        target: &LatValue,
        name: &str,
    ) -> Result<LatValue, LatError> {
        match &target.kind {
            ValueKind::Struct(s) => {
                let data = s.borrow();
                match data.field_index(name) {
                    Some(i) => Ok(data.fields[i].clone()),
                    None => Err(LatError::missing_field(&data.name.clone(), name)),
                }
            }
            ValueKind::Map(map) => map
                .borrow()
                .entries
                .get(name)
                .cloned()
                .ok_or_else(|| LatError::missing_field("map", name)),
            ValueKind::Range(a, b) => match name {
                "start" => Ok(LatValue::int(*a)),
                "end" => Ok(LatValue::int(*b)),
                _ => Err(LatError::missing_field("range", name)),
            },
            _ => Err(LatError::missing_field(target.type_name(), name)),
        }
    }

    pub(super) fn set_field(
        &mut self,
        target: &LatValue,
        name: &str,
        value: LatValue,
    ) -> Result<(), LatError> {
        if target.phase == Phase::Crystal {
            return Err(LatError::crystal_mutation(target.type_name()));
        }
        match &target.kind {
            ValueKind::Struct(s) => {
                let index = {
                    let data = s.borrow();
                    if data.field_phase(
                        data.field_index(name).unwrap_or(usize::MAX),
                        target.phase,
                    ) == Phase::Crystal
                    {
                        return Err(LatError::crystal_mutation(&format!(
                            "field '{}'",
                            name
                        )));
                    }
                    data.field_index(name)
                };
                match index {
                    Some(i) => {
                        s.borrow_mut().fields[i] = value;
                        Ok(())
                    }
                    None => {
                        let type_name = s.borrow().name.clone();
                        Err(LatError::missing_field(&type_name, name))
                    }
                }
            }
            ValueKind::Map(map) => {
                if map.borrow().key_phase(name, target.phase) == Phase::Crystal {
                    return Err(LatError::crystal_mutation(&format!(
                        "map key '{}'",
                        name
                    )));
                }
                map.borrow_mut().entries.insert(name, value);
                Ok(())
            }
            _ => Err(LatError::type_error(format!(
                "cannot set field on {}",
                target.type_name()
            ))),
        }
    }
}

fn element_at(elems: &[LatValue], i: i64, what: &str) -> Result<LatValue, LatError> {
    if i < 0 || i as usize >= elems.len() {
        return Err(LatError::bad_index(format!(
            "{} index {} out of bounds (len {})",
            what,
            i,
            elems.len()
        )));
    }
    Ok(elems[i as usize].clone())
}

fn slice_bounds(start: i64, end: i64, len: usize) -> Result<(usize, usize), LatError> {
    if start < 0 || end < start || end as usize > len {
        return Err(LatError::bad_index(format!(
            "slice {}..{} out of bounds (len {})",
            start, end, len
        )));
    }
    Ok((start as usize, end as usize))
}

fn as_number(v: &LatValue) -> Option<f64> {
    match v.kind {
        ValueKind::Int(n) => Some(n as f64),
        ValueKind::Float(x) => Some(x),
        _ => None,
    }
}

fn arithmetic(op: Opcode, lhs: &LatValue, rhs: &LatValue) -> Result<LatValue, LatError> {
    match (&lhs.kind, &rhs.kind) {
        (ValueKind::Int(a), ValueKind::Int(b)) => {
            let (a, b) = (*a, *b);
            let out = match op {
                Opcode::Add => a.wrapping_add(b),
                Opcode::Sub => a.wrapping_sub(b),
                Opcode::Mul => a.wrapping_mul(b),
                Opcode::Div => {
                    if b == 0 {
                        return Err(LatError::divide_by_zero());
                    }
                    a.wrapping_div(b)
                }
                Opcode::Mod => {
                    if b == 0 {
                        return Err(LatError::divide_by_zero());
                    }
                    a.wrapping_rem(b)
                }
                _ => return Err(LatError::internal("bad arithmetic opcode")),
            };
            Ok(LatValue::int(out))
        }
        _ => {
            let (a, b) = match (as_number(lhs), as_number(rhs)) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(LatError::type_error(format!(
                        "cannot apply {} to {} and {}",
                        op.mnemonic(),
                        lhs.type_name(),
                        rhs.type_name()
                    )))
                }
            };
            let out = match op {
                Opcode::Add => a + b,
                Opcode::Sub => a - b,
                Opcode::Mul => a * b,
                Opcode::Div => a / b,
                Opcode::Mod => a % b,
                _ => return Err(LatError::internal("bad arithmetic opcode")),
            };
            Ok(LatValue::float(out))
        }
    }
}

fn comparison(op: Opcode, lhs: &LatValue, rhs: &LatValue) -> Result<LatValue, LatError> {
    let ordering = match (&lhs.kind, &rhs.kind) {
        (ValueKind::Str(a), ValueKind::Str(b)) => a.as_str().cmp(b.as_str()),
        _ => match (as_number(lhs), as_number(rhs)) {
            (Some(a), Some(b)) => a
                .partial_cmp(&b)
                .unwrap_or(std::cmp::Ordering::Greater),
            _ => {
                return Err(LatError::type_error(format!(
                    "cannot compare {} and {}",
                    lhs.type_name(),
                    rhs.type_name()
                )))
            }
        },
    };
    let out = match op {
        Opcode::Lt => ordering.is_lt(),
        Opcode::Gt => ordering.is_gt(),
        Opcode::LtEq => ordering.is_le(),
        Opcode::GtEq => ordering.is_ge(),
        _ => return Err(LatError::internal("bad comparison opcode")),
    };
    Ok(LatValue::boolean(out))
}

fn bitwise(op: Opcode, lhs: &LatValue, rhs: &LatValue) -> Result<LatValue, LatError> {
    let (a, b) = match (&lhs.kind, &rhs.kind) {
        (ValueKind::Int(a), ValueKind::Int(b)) => (*a, *b),
        _ => {
            return Err(LatError::type_error(format!(
                "bitwise {} expects ints, got {} and {}",
                op.mnemonic(),
                lhs.type_name(),
                rhs.type_name()
            )))
        }
    };
    let out = match op {
        Opcode::BitAnd => a & b,
        Opcode::BitOr => a | b,
        Opcode::BitXor => a ^ b,
        Opcode::Shl => a.wrapping_shl(b as u32),
        Opcode::Shr => a.wrapping_shr(b as u32),
        _ => return Err(LatError::internal("bad bitwise opcode")),
    };
    Ok(LatValue::int(out))
}
