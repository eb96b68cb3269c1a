/*
This code is part of the FloodCast flood simulation library.
Authors: The FloodCast Developers
Created: 18/03/2024
Last Modified: 27/04/2025
License: MIT
*/
use super::*;
use floodcast_common::utils::{ByteOrderReader, ByteOrderWriter, Endianness};
use std::fs::File;
use std::io::{BufReader, BufWriter, Error, ErrorKind};

// Header tags of the classic format.
const NC_DIMENSION: u32 = 0x0A;
const NC_VARIABLE: u32 = 0x0B;
const NC_ATTRIBUTE: u32 = 0x0C;
const STREAMING: u32 = 0xFFFF_FFFF;

fn round4(n: usize) -> usize {
    (n + 3) & !3usize
}

fn invalid(msg: String) -> Error {
    Error::new(ErrorKind::InvalidData, msg)
}

pub(crate) fn read_classic(file_name: &str, header_only: bool) -> Result<NcFile, Error> {
    let f = File::open(file_name)?;
    let mut reader = ByteOrderReader::new(BufReader::new(f), Endianness::BigEndian)?;

    let magic = [reader.read_u8()?, reader.read_u8()?, reader.read_u8()?];
    if magic != [b'C', b'D', b'F'] {
        return Err(invalid(format!("{} is not a NetCDF classic file.", file_name)));
    }
    let version = reader.read_u8()?;
    if version != 1 && version != 2 {
        return Err(invalid(format!(
            "{} uses unsupported NetCDF format version {}.",
            file_name, version
        )));
    }

    let raw_numrecs = reader.read_u32()?;

    let mut nc = NcFile::new(file_name);

    // dimension list
    let tag = reader.read_u32()?;
    let nelems = reader.read_u32()? as usize;
    if tag != NC_DIMENSION && !(tag == 0 && nelems == 0) {
        return Err(invalid(format!("Malformed dimension list in {}.", file_name)));
    }
    for _ in 0..nelems {
        let name = read_name(&mut reader)?;
        let length = reader.read_u32()? as usize;
        nc.dimensions.push(NcDimension {
            name: name,
            length: length,
            is_record: length == 0,
        });
    }

    nc.global_attributes = read_attribute_list(&mut reader, file_name)?;

    // variable list
    let tag = reader.read_u32()?;
    let nelems = reader.read_u32()? as usize;
    if tag != NC_VARIABLE && !(tag == 0 && nelems == 0) {
        return Err(invalid(format!("Malformed variable list in {}.", file_name)));
    }
    for _ in 0..nelems {
        let name = read_name(&mut reader)?;
        let ndims = reader.read_u32()? as usize;
        let mut dim_ids: Vec<usize> = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            let id = reader.read_u32()? as usize;
            if id >= nc.dimensions.len() {
                return Err(invalid(format!(
                    "Variable '{}' references dimension {} which does not exist.",
                    name, id
                )));
            }
            dim_ids.push(id);
        }
        let attributes = read_attribute_list(&mut reader, file_name)?;
        let data_type = NcType::from_code(reader.read_i32()?)?;
        let vsize = reader.read_u32()? as usize;
        let begin = if version == 1 {
            reader.read_u32()? as u64
        } else {
            reader.read_u64()?
        };
        nc.variables.push(NcVariable {
            name: name,
            dim_ids: dim_ids,
            data_type: data_type,
            attributes: attributes,
            data: vec![],
            vsize: vsize,
            begin: begin,
        });
    }

    // The record size is the sum of the record variables' padded slab sizes,
    // except when there is exactly one record variable of a sub-4-byte type,
    // in which case records are packed without padding.
    let record_vars: Vec<usize> = (0..nc.variables.len())
        .filter(|i| is_record_var(&nc, &nc.variables[*i]))
        .collect();
    nc.record_size = record_vars.iter().map(|i| nc.variables[*i].vsize).sum();
    if record_vars.len() == 1 {
        let i = record_vars[0];
        if nc.variables[i].data_type.size() < 4 {
            let slab = record_slab_elements(&nc, &nc.variables[i]);
            nc.record_size = slab * nc.variables[i].data_type.size();
        }
    }

    nc.num_records = if raw_numrecs == STREAMING {
        match record_vars.iter().map(|i| nc.variables[*i].begin).min() {
            Some(first_begin) if nc.record_size > 0 => {
                (reader.len() as u64).saturating_sub(first_begin) as usize / nc.record_size
            }
            _ => 0,
        }
    } else {
        raw_numrecs as usize
    };

    if !header_only {
        for i in 0..nc.variables.len() {
            let var = &nc.variables[i];
            let data = if is_record_var(&nc, var) {
                let slab = record_slab_elements(&nc, var);
                let mut data: Vec<f64> = Vec::with_capacity(slab * nc.num_records);
                for rec in 0..nc.num_records {
                    reader.seek((var.begin + (rec * nc.record_size) as u64) as usize)?;
                    read_values(&mut reader, var.data_type, slab, &mut data)?;
                }
                data
            } else {
                let n: usize = var.dim_ids.iter().map(|id| nc.dimensions[*id].length).product();
                let mut data: Vec<f64> = Vec::with_capacity(n);
                reader.seek(var.begin as usize)?;
                read_values(&mut reader, var.data_type, n, &mut data)?;
                data
            };
            nc.variables[i].data = data;
        }
    }

    Ok(nc)
}

pub(crate) fn read_classic_slab(nc: &NcFile, var_name: &str, index: usize) -> Result<Vec<f64>, Error> {
    let var = nc.get_variable(var_name).ok_or_else(|| {
        Error::new(
            ErrorKind::NotFound,
            format!("No variable named '{}' in {}.", var_name, nc.file_name),
        )
    })?;
    if var.dim_ids.is_empty() {
        return Err(invalid(format!(
            "Variable '{}' is a scalar and has no leading dimension to slice.",
            var_name
        )));
    }
    let leading = &nc.dimensions[var.dim_ids[0]];
    let slab: usize = var.dim_ids[1..]
        .iter()
        .map(|id| nc.dimension_length(*id))
        .product();
    let offset: u64;
    if leading.is_record {
        if index >= nc.num_records {
            return Err(invalid(format!(
                "Record {} is out of range for '{}' ({} records).",
                index, var_name, nc.num_records
            )));
        }
        offset = var.begin + (index * nc.record_size) as u64;
    } else {
        if index >= leading.length {
            return Err(invalid(format!(
                "Index {} is out of range for dimension '{}' (length {}).",
                index, leading.name, leading.length
            )));
        }
        offset = var.begin + (index * slab * var.data_type.size()) as u64;
    }

    let f = File::open(&nc.file_name)?;
    let mut reader = ByteOrderReader::new(BufReader::new(f), Endianness::BigEndian)?;
    reader.seek(offset as usize)?;
    let mut data: Vec<f64> = Vec::with_capacity(slab);
    read_values(&mut reader, var.data_type, slab, &mut data)?;
    Ok(data)
}

pub(crate) fn read_classic_variable(nc: &NcFile, var_name: &str) -> Result<Vec<f64>, Error> {
    let var = nc.get_variable(var_name).ok_or_else(|| {
        Error::new(
            ErrorKind::NotFound,
            format!("No variable named '{}' in {}.", var_name, nc.file_name),
        )
    })?;
    let f = File::open(&nc.file_name)?;
    let mut reader = ByteOrderReader::new(BufReader::new(f), Endianness::BigEndian)?;
    if is_record_var(nc, var) {
        let slab = record_slab_elements(nc, var);
        let mut data: Vec<f64> = Vec::with_capacity(slab * nc.num_records);
        for rec in 0..nc.num_records {
            reader.seek((var.begin + (rec * nc.record_size) as u64) as usize)?;
            read_values(&mut reader, var.data_type, slab, &mut data)?;
        }
        return Ok(data);
    }
    let n: usize = var.dim_ids.iter().map(|id| nc.dimensions[*id].length).product();
    let mut data: Vec<f64> = Vec::with_capacity(n);
    reader.seek(var.begin as usize)?;
    read_values(&mut reader, var.data_type, n, &mut data)?;
    Ok(data)
}

pub(crate) fn write_classic(nc: &NcFile) -> Result<(), Error> {
    for dim in &nc.dimensions {
        if dim.is_record {
            return Err(invalid(format!(
                "The writer emits fixed dimensions only; '{}' is a record dimension.",
                dim.name
            )));
        }
    }
    let mut vsizes: Vec<usize> = Vec::with_capacity(nc.variables.len());
    for var in &nc.variables {
        let n: usize = var.dim_ids.iter().map(|id| nc.dimensions[*id].length).product();
        if var.data.len() != n {
            return Err(invalid(format!(
                "Variable '{}' holds {} values but its dimensions imply {}.",
                var.name,
                var.data.len(),
                n
            )));
        }
        vsizes.push(round4(n * var.data_type.size()));
    }

    // CDF-1 offsets are 32-bit; fall back to the 64-bit offset variant when
    // the data section would overflow them.
    let mut version = 1u8;
    loop {
        let header = header_size(nc, version);
        let mut offset = header;
        let mut overflow = false;
        for vsize in &vsizes {
            offset += vsize;
            if offset > i32::MAX as usize {
                overflow = true;
                break;
            }
        }
        if overflow && version == 1 {
            version = 2;
            continue;
        }
        if overflow {
            return Err(invalid(format!(
                "{} is too large for the classic 64-bit offset format.",
                nc.file_name
            )));
        }
        break;
    }

    let f = File::create(&nc.file_name)?;
    let mut writer = ByteOrderWriter::new(BufWriter::new(f), Endianness::BigEndian);

    writer.write_bytes(&[b'C', b'D', b'F', version])?;
    writer.write_u32(0)?; // numrecs

    if nc.dimensions.is_empty() {
        writer.write_u32(0)?;
        writer.write_u32(0)?;
    } else {
        writer.write_u32(NC_DIMENSION)?;
        writer.write_u32(nc.dimensions.len() as u32)?;
        for dim in &nc.dimensions {
            write_name(&mut writer, &dim.name)?;
            writer.write_u32(dim.length as u32)?;
        }
    }

    write_attribute_list(&mut writer, &nc.global_attributes)?;

    if nc.variables.is_empty() {
        writer.write_u32(0)?;
        writer.write_u32(0)?;
    } else {
        writer.write_u32(NC_VARIABLE)?;
        writer.write_u32(nc.variables.len() as u32)?;
        let mut begin = header_size(nc, version);
        for (i, var) in nc.variables.iter().enumerate() {
            write_name(&mut writer, &var.name)?;
            writer.write_u32(var.dim_ids.len() as u32)?;
            for id in &var.dim_ids {
                writer.write_u32(*id as u32)?;
            }
            write_attribute_list(&mut writer, &var.attributes)?;
            writer.write_i32(var.data_type.code())?;
            writer.write_u32(vsizes[i] as u32)?;
            if version == 1 {
                writer.write_u32(begin as u32)?;
            } else {
                writer.write_i64(begin as i64)?;
            }
            begin += vsizes[i];
        }
    }

    for (i, var) in nc.variables.iter().enumerate() {
        let mut written = 0usize;
        for value in &var.data {
            written += write_value(&mut writer, var.data_type, *value)?;
        }
        for _ in written..vsizes[i] {
            writer.write_u8(0)?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn is_record_var(nc: &NcFile, var: &NcVariable) -> bool {
    var.dim_ids.iter().any(|id| nc.dimensions[*id].is_record)
}

/// Values per record of a record variable (the product of its fixed
/// dimension lengths).
fn record_slab_elements(nc: &NcFile, var: &NcVariable) -> usize {
    var.dim_ids
        .iter()
        .filter(|id| !nc.dimensions[**id].is_record)
        .map(|id| nc.dimensions[*id].length)
        .product()
}

fn name_size(name: &str) -> usize {
    4 + round4(name.len())
}

fn attribute_size(attr: &NcAttribute) -> usize {
    // name + type + nelems + padded values
    name_size(&attr.name)
        + 8
        + round4(attr.value.num_elements() * attr.value.nc_type().size())
}

fn attribute_list_size(attrs: &[NcAttribute]) -> usize {
    8 + attrs.iter().map(attribute_size).sum::<usize>()
}

fn header_size(nc: &NcFile, version: u8) -> usize {
    let offset_size = if version == 1 { 4 } else { 8 };
    let mut size = 8; // magic + numrecs
    size += 8; // dim_list tag + count
    for dim in &nc.dimensions {
        size += name_size(&dim.name) + 4;
    }
    size += attribute_list_size(&nc.global_attributes);
    size += 8; // var_list tag + count
    for var in &nc.variables {
        size += name_size(&var.name)
            + 4
            + 4 * var.dim_ids.len()
            + attribute_list_size(&var.attributes)
            + 8
            + offset_size;
    }
    size
}

fn read_name<R: std::io::Read + std::io::Seek>(reader: &mut ByteOrderReader<R>) -> Result<String, Error> {
    let len = reader.read_u32()? as usize;
    let name = reader.read_utf8(len)?;
    reader.inc_pos(round4(len) - len)?;
    Ok(name)
}

fn write_name<W: std::io::Write>(writer: &mut ByteOrderWriter<W>, name: &str) -> Result<(), Error> {
    writer.write_u32(name.len() as u32)?;
    writer.write_bytes(name.as_bytes())?;
    for _ in name.len()..round4(name.len()) {
        writer.write_u8(0)?;
    }
    Ok(())
}

fn read_attribute_list<R: std::io::Read + std::io::Seek>(
    reader: &mut ByteOrderReader<R>,
    file_name: &str,
) -> Result<Vec<NcAttribute>, Error> {
    let tag = reader.read_u32()?;
    let nelems = reader.read_u32()? as usize;
    if tag != NC_ATTRIBUTE && !(tag == 0 && nelems == 0) {
        return Err(invalid(format!("Malformed attribute list in {}.", file_name)));
    }
    let mut attrs: Vec<NcAttribute> = Vec::with_capacity(nelems);
    for _ in 0..nelems {
        let name = read_name(reader)?;
        let data_type = NcType::from_code(reader.read_i32()?)?;
        let n = reader.read_u32()? as usize;
        let value = match data_type {
            NcType::Byte => {
                let mut v: Vec<i8> = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(reader.read_i8()?);
                }
                NcValue::Bytes(v)
            }
            NcType::Char => {
                let s = reader.read_utf8(n)?;
                NcValue::Text(s.trim_end_matches('\0').to_string())
            }
            NcType::Short => {
                let mut v: Vec<i16> = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(reader.read_i16()?);
                }
                NcValue::Shorts(v)
            }
            NcType::Int => {
                let mut v: Vec<i32> = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(reader.read_i32()?);
                }
                NcValue::Ints(v)
            }
            NcType::Float => {
                let mut v: Vec<f32> = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(reader.read_f32()?);
                }
                NcValue::Floats(v)
            }
            NcType::Double => {
                let mut v: Vec<f64> = Vec::with_capacity(n);
                for _ in 0..n {
                    v.push(reader.read_f64()?);
                }
                NcValue::Doubles(v)
            }
        };
        let consumed = n * data_type.size();
        reader.inc_pos(round4(consumed) - consumed)?;
        attrs.push(NcAttribute {
            name: name,
            value: value,
        });
    }
    Ok(attrs)
}

fn write_attribute_list<W: std::io::Write>(
    writer: &mut ByteOrderWriter<W>,
    attrs: &[NcAttribute],
) -> Result<(), Error> {
    if attrs.is_empty() {
        writer.write_u32(0)?;
        writer.write_u32(0)?;
        return Ok(());
    }
    writer.write_u32(NC_ATTRIBUTE)?;
    writer.write_u32(attrs.len() as u32)?;
    for attr in attrs {
        write_name(writer, &attr.name)?;
        writer.write_i32(attr.value.nc_type().code())?;
        writer.write_u32(attr.value.num_elements() as u32)?;
        let mut written = 0usize;
        match &attr.value {
            NcValue::Bytes(v) => {
                for x in v {
                    writer.write_u8(*x as u8)?;
                }
                written = v.len();
            }
            NcValue::Text(s) => {
                writer.write_bytes(s.as_bytes())?;
                written = s.len();
            }
            NcValue::Shorts(v) => {
                for x in v {
                    writer.write_i16(*x)?;
                }
                written = v.len() * 2;
            }
            NcValue::Ints(v) => {
                for x in v {
                    writer.write_i32(*x)?;
                }
                written = v.len() * 4;
            }
            NcValue::Floats(v) => {
                for x in v {
                    writer.write_f32(*x)?;
                }
                written = v.len() * 4;
            }
            NcValue::Doubles(v) => {
                for x in v {
                    writer.write_f64(*x)?;
                }
                written = v.len() * 8;
            }
        }
        for _ in written..round4(written) {
            writer.write_u8(0)?;
        }
    }
    Ok(())
}

fn read_values<R: std::io::Read + std::io::Seek>(
    reader: &mut ByteOrderReader<R>,
    data_type: NcType,
    n: usize,
    data: &mut Vec<f64>,
) -> Result<(), Error> {
    match data_type {
        NcType::Byte | NcType::Char => {
            for _ in 0..n {
                data.push(reader.read_i8()? as f64);
            }
        }
        NcType::Short => {
            for _ in 0..n {
                data.push(reader.read_i16()? as f64);
            }
        }
        NcType::Int => {
            for _ in 0..n {
                data.push(reader.read_i32()? as f64);
            }
        }
        NcType::Float => {
            for _ in 0..n {
                data.push(reader.read_f32()? as f64);
            }
        }
        NcType::Double => {
            for _ in 0..n {
                data.push(reader.read_f64()?);
            }
        }
    }
    Ok(())
}

/// Writes one value in the variable's external type; returns the number of
/// bytes written.
fn write_value<W: std::io::Write>(
    writer: &mut ByteOrderWriter<W>,
    data_type: NcType,
    value: f64,
) -> Result<usize, Error> {
    match data_type {
        NcType::Byte | NcType::Char => {
            writer.write_u8(value as i8 as u8)?;
            Ok(1)
        }
        NcType::Short => {
            writer.write_i16(value as i16)?;
            Ok(2)
        }
        NcType::Int => {
            writer.write_i32(value as i32)?;
            Ok(4)
        }
        NcType::Float => {
            writer.write_f32(value as f32)?;
            Ok(4)
        }
        NcType::Double => {
            writer.write_f64(value)?;
            Ok(8)
        }
    }
}
